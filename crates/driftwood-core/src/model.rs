//! Records returned by the Shipwrecked API.
//!
//! Field names follow the remote JSON (camelCase, `projectID`). Optional
//! fields default so that partial payloads still decode.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A time-tracking entry attached to a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HackatimeLink {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "hackatimeName")]
    pub name: String,
    #[serde(default)]
    pub raw_hours: Option<f64>,
    #[serde(default)]
    pub hours_override: Option<f64>,
}

impl HackatimeLink {
    /// Override if a reviewer set one, otherwise the tracked hours.
    pub fn effective_hours(&self) -> f64 {
        self.hours_override.or(self.raw_hours).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub code_url: Option<String>,
    #[serde(default)]
    pub playable_url: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub viral: bool,
    #[serde(default)]
    pub shipped: bool,
    #[serde(default)]
    pub in_review: Option<bool>,
    #[serde(default)]
    pub raw_hours: Option<f64>,
    #[serde(default)]
    pub hours_override: Option<f64>,
    #[serde(default)]
    pub hackatime_links: Vec<HackatimeLink>,
}

/// Anything that carries tracked hours, either directly or through links.
pub trait TrackedHours {
    fn links(&self) -> &[HackatimeLink];
    fn raw_hours(&self) -> Option<f64>;
}

impl TrackedHours for Project {
    fn links(&self) -> &[HackatimeLink] {
        &self.hackatime_links
    }

    fn raw_hours(&self) -> Option<f64> {
        self.raw_hours
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub slack: Option<String>,
    #[serde(default)]
    pub hackatime_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub status: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserWithProjects {
    pub user: User,
    pub projects: Vec<Project>,
}

impl UserWithProjects {
    /// Bucket a flat project list by owner. Users appear in the order their
    /// first project does; only the id is known for each of them.
    pub fn group_by_owner(projects: Vec<Project>) -> Vec<UserWithProjects> {
        let mut grouped: Vec<UserWithProjects> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for project in projects {
            let slot = match index.get(&project.user_id) {
                Some(&slot) => slot,
                None => {
                    index.insert(project.user_id.clone(), grouped.len());
                    grouped.push(UserWithProjects {
                        user: User {
                            id: project.user_id.clone(),
                            ..User::default()
                        },
                        projects: Vec::new(),
                    });
                    grouped.len() - 1
                }
            };
            grouped[slot].projects.push(project);
        }

        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_decodes_remote_shape() {
        let json = r#"{
            "projectID": "p-1",
            "name": "Raft",
            "userId": "u-1",
            "shipped": true,
            "viral": false,
            "rawHours": 3.5,
            "hackatimeLinks": [
                {"id": "l-1", "hackatimeName": "raft", "rawHours": 2.0, "hoursOverride": 4.0}
            ]
        }"#;
        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.project_id, "p-1");
        assert!(project.shipped);
        assert_eq!(project.in_review, None);
        assert_eq!(project.hackatime_links.len(), 1);
        assert_eq!(project.hackatime_links[0].name, "raft");
        assert_eq!(project.hackatime_links[0].effective_hours(), 4.0);
    }

    #[test]
    fn test_group_by_owner_keeps_first_seen_order() {
        let project = |id: &str, owner: &str| Project {
            project_id: id.to_string(),
            user_id: owner.to_string(),
            ..Project::default()
        };
        let grouped = UserWithProjects::group_by_owner(vec![
            project("p1", "bob"),
            project("p2", "ann"),
            project("p3", "bob"),
        ]);
        let owners: Vec<_> = grouped.iter().map(|u| u.user.id.as_str()).collect();
        assert_eq!(owners, vec!["bob", "ann"]);
        assert_eq!(grouped[0].projects.len(), 2);
        assert_eq!(grouped[1].projects[0].project_id, "p2");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let user = User {
            id: "u-9".to_string(),
            ..User::default()
        };
        assert_eq!(user.display_name(), "u-9");
    }
}
