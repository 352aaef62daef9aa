//! Core domain model and scoring for Driftwood.
//!
//! Everything in this crate is pure: no I/O, no async, and every function is
//! total over its inputs. The adapters crate fetches [`model::Project`] records
//! through the tunnel and hands them here.

pub mod clustering;
pub mod model;
pub mod scoring;
pub mod stats;

pub use clustering::{
    categorize_users, gallery_to_metrics, generate_user_cluster_analysis, lookup_category,
    users_to_metrics, UserCategory, UserClusterAnalysis, UserMetrics,
};
pub use model::{HackatimeLink, Project, TrackedHours, User, UserWithProjects};
pub use scoring::{
    aggregate_progress, classify_project_progress, compute_shells, effective_hours,
    island_status, leaderboard, rank_projects, total_progress, IslandStatus, LeaderboardEntry,
    ProgressTriple,
};
pub use stats::{percentile, Summary};
