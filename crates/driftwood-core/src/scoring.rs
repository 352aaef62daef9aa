//! Progress, shells and leaderboard scoring.
//!
//! Progress is accumulated per project with a cap that depends on how the
//! project is classified, and only a user's four biggest projects count toward
//! the 60-hour goal. Hours beyond that feed the shells currency instead.

use crate::model::{Project, TrackedHours, UserWithProjects};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Per-project cap for viral projects.
pub const VIRAL_CAP: f64 = 15.0;
/// Per-project cap for shipped projects.
pub const SHIPPED_CAP: f64 = 15.0;
/// Per-project cap for everything else.
pub const UNSHIPPED_CAP: f64 = 14.75;
/// Hours needed for 100% progress.
pub const PROGRESS_GOAL_HOURS: f64 = 60.0;
/// Number of projects that count toward progress.
pub const TOP_PROJECT_COUNT: usize = 4;
/// Shipped projects at or above this many hours count toward island status.
pub const ISLAND_PROJECT_HOURS: f64 = 15.0;
/// Hours in a top project that already went toward progress.
const SHELLS_PROGRESS_HOURS: f64 = 15.0;

/// The golden ratio.
const PHI: f64 = 1.618_033_988_749_895;

/// Sum of link hours when links exist, otherwise the entity's own hours.
pub fn effective_hours<T: TrackedHours + ?Sized>(item: &T) -> f64 {
    let links = item.links();
    if links.is_empty() {
        item.raw_hours().unwrap_or(0.0)
    } else {
        links.iter().map(|link| link.effective_hours()).sum()
    }
}

/// Hours split by classification. For a single project exactly one component
/// is non-zero; aggregates hold percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressTriple {
    pub viral: f64,
    pub shipped: f64,
    pub unshipped: f64,
}

impl ProgressTriple {
    pub fn total(&self) -> f64 {
        self.viral + self.shipped + self.unshipped
    }

    fn add(self, other: ProgressTriple) -> ProgressTriple {
        ProgressTriple {
            viral: self.viral + other.viral,
            shipped: self.shipped + other.shipped,
            unshipped: self.unshipped + other.unshipped,
        }
    }

    fn as_percent_of(self, goal: f64) -> ProgressTriple {
        ProgressTriple {
            viral: self.viral / goal * 100.0,
            shipped: self.shipped / goal * 100.0,
            unshipped: self.unshipped / goal * 100.0,
        }
    }
}

pub fn total_progress(progress: &ProgressTriple) -> f64 {
    progress.total()
}

pub fn classify_project_progress(project: &Project) -> ProgressTriple {
    let hours = effective_hours(project);
    if project.viral {
        ProgressTriple {
            viral: hours.min(VIRAL_CAP),
            ..ProgressTriple::default()
        }
    } else if project.shipped {
        ProgressTriple {
            shipped: hours.min(SHIPPED_CAP),
            ..ProgressTriple::default()
        }
    } else {
        ProgressTriple {
            unshipped: hours.min(UNSHIPPED_CAP),
            ..ProgressTriple::default()
        }
    }
}

/// Projects ordered by contributed hours, largest first. Ties keep input order.
pub fn rank_projects(projects: &[Project]) -> Vec<&Project> {
    let mut ranked: Vec<(&Project, f64)> = projects
        .iter()
        .map(|p| (p, classify_project_progress(p).total()))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().map(|(p, _)| p).collect()
}

/// Progress toward the goal as percentages, counting the top four projects.
pub fn aggregate_progress(projects: &[Project]) -> ProgressTriple {
    rank_projects(projects)
        .into_iter()
        .take(TOP_PROJECT_COUNT)
        .map(classify_project_progress)
        .fold(ProgressTriple::default(), ProgressTriple::add)
        .as_percent_of(PROGRESS_GOAL_HOURS)
}

/// Shells earned from shipped work that did not go toward progress.
pub fn compute_shells(projects: &[Project]) -> u64 {
    let top: HashSet<&str> = rank_projects(projects)
        .into_iter()
        .take(TOP_PROJECT_COUNT)
        .map(|p| p.project_id.as_str())
        .collect();

    let rate = 10.0 * PHI;
    let shells: f64 = projects
        .iter()
        .filter(|p| p.shipped)
        .map(|p| {
            let hours = effective_hours(p);
            if top.contains(p.project_id.as_str()) {
                (hours - SHELLS_PROGRESS_HOURS).max(0.0) * rate
            } else {
                hours * rate
            }
        })
        .sum();

    shells.floor() as u64
}

/// Where a user stands for the island event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IslandStatus {
    Invitation,
    Waitlist,
}

impl IslandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IslandStatus::Invitation => "invitation",
            IslandStatus::Waitlist => "waitlist",
        }
    }
}

impl std::fmt::Display for IslandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Four shipped projects of at least 15 hours earn a spot; any viral
/// project upgrades it to an invitation.
pub fn island_status(projects: &[Project]) -> Option<IslandStatus> {
    let qualifying = projects
        .iter()
        .filter(|p| p.shipped && effective_hours(*p) >= ISLAND_PROJECT_HOURS)
        .count();
    if qualifying < TOP_PROJECT_COUNT {
        return None;
    }
    if projects.iter().any(|p| p.viral) {
        Some(IslandStatus::Invitation)
    } else {
        Some(IslandStatus::Waitlist)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user: UserWithProjects,
    pub progress: ProgressTriple,
    pub shells: u64,
    pub island: Option<IslandStatus>,
}

/// Users ordered by total progress, then by shells. Both descending.
pub fn leaderboard(users: Vec<UserWithProjects>) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = users
        .into_iter()
        .map(|user| LeaderboardEntry {
            progress: aggregate_progress(&user.projects),
            shells: compute_shells(&user.projects),
            island: island_status(&user.projects),
            user,
        })
        .collect();
    entries.sort_by(compare_entries);
    entries
}

fn compare_entries(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    match b.progress.total().total_cmp(&a.progress.total()) {
        Ordering::Equal => b.shells.cmp(&a.shells),
        other => other,
    }
}
