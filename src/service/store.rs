use std::collections::{BTreeMap, BTreeSet};

use crate::transport::{Request, Response};

/// In-memory objects keyed by type and id, each owned by a group.
#[derive(Debug, Default, Clone)]
pub struct ObjectStore {
    objects: BTreeMap<String, BTreeMap<i64, String>>,
    groups: BTreeSet<String>,
}

/// `/Image` and `Image` name the same type.
fn type_key(target_type: &str) -> String {
    target_type.trim_start_matches('/').to_string()
}

fn not_found(target_type: &str, id: i64) -> Response {
    let mut parameters = BTreeMap::new();
    parameters.insert("type".to_string(), target_type.to_string());
    parameters.insert("id".to_string(), id.to_string());
    Response::Err {
        category: "graph".to_string(),
        name: "not-found".to_string(),
        parameters,
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn insert(&mut self, target_type: &str, id: i64, group: &str) {
        self.add_group(group);
        self.objects
            .entry(type_key(target_type))
            .or_default()
            .insert(id, group.to_string());
    }

    pub fn contains(&self, target_type: &str, id: i64) -> bool {
        self.group_of(target_type, id).is_some()
    }

    pub fn group_of(&self, target_type: &str, id: i64) -> Option<&str> {
        self.objects
            .get(&type_key(target_type))
            .and_then(|ids| ids.get(&id))
            .map(String::as_str)
    }

    pub fn count(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    fn remove(&mut self, target_type: &str, id: i64) -> bool {
        self.objects
            .get_mut(&type_key(target_type))
            .is_some_and(|ids| ids.remove(&id).is_some())
    }

    /// Execute one non-batch request. Batches are split by the caller so
    /// that each child is reported as its own step.
    pub fn apply(&mut self, request: &Request) -> Response {
        match request {
            Request::Delete { target_type, id } => {
                if self.remove(target_type, *id) {
                    Response::DeleteRsp {
                        actual_deletes: 1,
                        warning: String::new(),
                    }
                } else {
                    not_found(target_type, *id)
                }
            }
            Request::Delete2 { targets, dry_run } => {
                let mut deleted_objects: BTreeMap<String, Vec<i64>> = BTreeMap::new();
                for (target_type, ids) in targets {
                    for id in ids {
                        let hit = if *dry_run {
                            self.contains(target_type, *id)
                        } else {
                            self.remove(target_type, *id)
                        };
                        if hit {
                            deleted_objects
                                .entry(target_type.clone())
                                .or_default()
                                .push(*id);
                        }
                    }
                }
                Response::Delete2Rsp { deleted_objects }
            }
            Request::Chgrp {
                target_type,
                id,
                group,
            } => {
                if !self.has_group(group) {
                    let mut rsp = Response::error("chgrp", "unknown-group");
                    if let Response::Err { parameters, .. } = &mut rsp {
                        parameters.insert("group".to_string(), group.clone());
                    }
                    return rsp;
                }
                match self
                    .objects
                    .get_mut(&type_key(target_type))
                    .and_then(|ids| ids.get_mut(id))
                {
                    Some(owner) => {
                        *owner = group.clone();
                        Response::Ok
                    }
                    None => not_found(target_type, *id),
                }
            }
            Request::DoAll { requests } => Response::DoAllRsp {
                responses: requests.iter().map(|r| self.apply(r)).collect(),
            },
        }
    }
}
