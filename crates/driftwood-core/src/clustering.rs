//! Percentile-based user clustering.
//!
//! Users are bucketed into whales, shippers and newbies from three metrics:
//! total hours, project count and shipped-project count. Thresholds are the
//! quartiles of each metric across the population being analysed.

use crate::model::{Project, UserWithProjects};
use crate::scoring::effective_hours;
use crate::stats::{percentile, sorted_values, Summary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCategory {
    Whale,
    Shipper,
    Newbie,
}

impl UserCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserCategory::Whale => "whale",
            UserCategory::Shipper => "shipper",
            UserCategory::Newbie => "newbie",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            UserCategory::Whale => {
                "high-impact creator with significant hours, multiple projects, and regular shipping"
            }
            UserCategory::Shipper => {
                "active contributor with balanced engagement and shipping activity"
            }
            UserCategory::Newbie => "new or low-activity user with minimal projects and shipping",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            UserCategory::Whale => "🐳",
            UserCategory::Shipper => "📦",
            UserCategory::Newbie => "👶",
        }
    }
}

impl std::fmt::Display for UserCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetrics {
    pub user_id: String,
    pub total_hours: f64,
    pub project_count: u32,
    pub shipped_project_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<UserCategory>,
}

impl UserMetrics {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            total_hours: 0.0,
            project_count: 0,
            shipped_project_count: 0,
            category: None,
        }
    }

    fn record(&mut self, project: &Project) {
        self.project_count += 1;
        if project.shipped {
            self.shipped_project_count += 1;
        }
        self.total_hours += effective_hours(project);
    }
}

/// Group gallery projects by owner, keeping first-seen user order.
pub fn gallery_to_metrics(projects: &[Project]) -> Vec<UserMetrics> {
    let mut order: Vec<UserMetrics> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for project in projects {
        let slot = *index.entry(project.user_id.as_str()).or_insert_with(|| {
            order.push(UserMetrics::new(project.user_id.clone()));
            order.len() - 1
        });
        order[slot].record(project);
    }

    order
}

pub fn users_to_metrics(users: &[UserWithProjects]) -> Vec<UserMetrics> {
    users
        .iter()
        .map(|u| {
            let mut metrics = UserMetrics::new(u.user.id.clone());
            for project in &u.projects {
                metrics.record(project);
            }
            metrics
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleThresholds {
    pub min_hours: f64,
    pub min_projects: f64,
    pub min_shipped: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipperThresholds {
    pub hour_range: (f64, f64),
    pub project_range: (f64, f64),
    pub shipped_range: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewbieThresholds {
    pub max_hours: f64,
    pub max_projects: f64,
    pub max_shipped: f64,
}

/// Thresholds in effect for one analysis. All `None` when there were no users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub whale: Option<WhaleThresholds>,
    pub shipper: Option<ShipperThresholds>,
    pub newbie: Option<NewbieThresholds>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Categorized {
    pub whales: Vec<UserMetrics>,
    pub shippers: Vec<UserMetrics>,
    pub newbies: Vec<UserMetrics>,
    pub thresholds: Thresholds,
}

struct Quartiles {
    p25: f64,
    p50: f64,
    p75: f64,
}

impl Quartiles {
    fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let sorted = sorted_values(values);
        Self {
            p25: percentile(&sorted, 25.0),
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
        }
    }
}

/// Assign each user to exactly one bucket.
///
/// A whale is in the top quartile on at least two metrics and at or above
/// the median on all three (with at least one shipped project). A newbie is
/// in the bottom quartile on hours and projects and has shipped nothing.
/// Everyone else is a shipper.
pub fn categorize_users(metrics: &[UserMetrics]) -> Categorized {
    if metrics.is_empty() {
        return Categorized::default();
    }

    let hours = Quartiles::of(metrics.iter().map(|u| u.total_hours));
    let projects = Quartiles::of(metrics.iter().map(|u| u.project_count as f64));
    let shipped = Quartiles::of(metrics.iter().map(|u| u.shipped_project_count as f64));

    let whale = WhaleThresholds {
        min_hours: hours.p50,
        min_projects: projects.p50,
        min_shipped: shipped.p50.max(1.0),
    };
    let newbie = NewbieThresholds {
        max_hours: hours.p25,
        max_projects: projects.p25.max(1.0),
        max_shipped: 0.0,
    };
    let shipper = ShipperThresholds {
        hour_range: (hours.p25, hours.p75),
        project_range: (projects.p25, projects.p75),
        shipped_range: (0.0, shipped.p75),
    };

    let mut out = Categorized {
        thresholds: Thresholds {
            whale: Some(whale),
            shipper: Some(shipper),
            newbie: Some(newbie),
        },
        ..Categorized::default()
    };

    for user in metrics {
        let user_hours = user.total_hours;
        let user_projects = user.project_count as f64;
        let user_shipped = user.shipped_project_count as f64;

        let high_dimensions = [
            user_hours >= hours.p75,
            user_projects >= projects.p75,
            user_shipped >= shipped.p75,
        ]
        .iter()
        .filter(|high| **high)
        .count();

        let meets_whale_minimums = user_hours >= whale.min_hours
            && user_projects >= whale.min_projects
            && user_shipped >= whale.min_shipped;

        let is_newbie = user_hours <= newbie.max_hours
            && user_projects <= newbie.max_projects
            && user_shipped <= newbie.max_shipped;

        let mut user = user.clone();
        if high_dimensions >= 2 && meets_whale_minimums {
            user.category = Some(UserCategory::Whale);
            out.whales.push(user);
        } else if is_newbie {
            user.category = Some(UserCategory::Newbie);
            out.newbies.push(user);
        } else {
            user.category = Some(UserCategory::Shipper);
            out.shippers.push(user);
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster<T> {
    pub count: usize,
    pub percentage: f64,
    pub users: Vec<String>,
    pub thresholds: Option<T>,
}

impl<T> Cluster<T> {
    fn from_members(members: &[UserMetrics], total: usize, thresholds: Option<T>) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            members.len() as f64 / total as f64 * 100.0
        };
        Self {
            count: members.len(),
            percentage,
            users: members.iter().map(|u| u.user_id.clone()).collect(),
            thresholds,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clusters {
    pub whales: Cluster<WhaleThresholds>,
    pub shippers: Cluster<ShipperThresholds>,
    pub newbies: Cluster<NewbieThresholds>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub hours: Summary,
    pub projects: Summary,
    pub shipped: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserClusterAnalysis {
    pub total_users: usize,
    pub clusters: Clusters,
    pub statistics: MetricStatistics,
}

pub fn generate_user_cluster_analysis(metrics: &[UserMetrics]) -> UserClusterAnalysis {
    let categorized = categorize_users(metrics);
    let total = metrics.len();

    let statistics = MetricStatistics {
        hours: Summary::of_sorted(&sorted_values(metrics.iter().map(|u| u.total_hours))),
        projects: Summary::of_sorted(&sorted_values(
            metrics.iter().map(|u| u.project_count as f64),
        )),
        shipped: Summary::of_sorted(&sorted_values(
            metrics.iter().map(|u| u.shipped_project_count as f64),
        )),
    };

    UserClusterAnalysis {
        total_users: total,
        clusters: Clusters {
            whales: Cluster::from_members(
                &categorized.whales,
                total,
                categorized.thresholds.whale,
            ),
            shippers: Cluster::from_members(
                &categorized.shippers,
                total,
                categorized.thresholds.shipper,
            ),
            newbies: Cluster::from_members(
                &categorized.newbies,
                total,
                categorized.thresholds.newbie,
            ),
        },
        statistics,
    }
}

/// Which bucket a user landed in, if they were part of the analysis.
pub fn lookup_category(analysis: &UserClusterAnalysis, user_id: &str) -> Option<UserCategory> {
    let clusters = &analysis.clusters;
    if clusters.whales.contains(user_id) {
        Some(UserCategory::Whale)
    } else if clusters.shippers.contains(user_id) {
        Some(UserCategory::Shipper)
    } else if clusters.newbies.contains(user_id) {
        Some(UserCategory::Newbie)
    } else {
        None
    }
}
