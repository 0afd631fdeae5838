//! Data shapes exchanged with the object service: requests, their typed
//! responses and the status snapshots reported while they run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CmdError, CmdResult};

/// Discriminant of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Delete,
    Delete2,
    Chgrp,
    DoAll,
}

/// An operation to be executed by the service. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Delete a single object, e.g. `/Image` 1.
    Delete {
        #[serde(alias = "type_name")]
        target_type: String,
        id: i64,
    },
    /// Graph delete over several targets; a dry run reports without removing.
    Delete2 {
        targets: BTreeMap<String, Vec<i64>>,
        #[serde(default)]
        dry_run: bool,
    },
    /// Move an object into another group.
    Chgrp {
        target_type: String,
        id: i64,
        group: String,
    },
    DoAll { requests: Vec<Request> },
}

impl Request {
    pub fn delete(target_type: impl Into<String>, id: i64) -> Self {
        Request::Delete {
            target_type: target_type.into(),
            id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Delete { .. } => RequestKind::Delete,
            Request::Delete2 { .. } => RequestKind::Delete2,
            Request::Chgrp { .. } => RequestKind::Chgrp,
            Request::DoAll { .. } => RequestKind::DoAll,
        }
    }

    /// Number of server-side steps the request is reported in.
    pub fn steps(&self) -> u32 {
        match self {
            Request::DoAll { requests } => requests.len() as u32,
            _ => 1,
        }
    }

    /// Parameter checks a service performs before accepting a request.
    pub fn validate(&self) -> CmdResult<()> {
        match self {
            Request::Delete { target_type, id } | Request::Chgrp { target_type, id, .. } => {
                check_target(target_type, *id)?;
                if let Request::Chgrp { group, .. } = self {
                    if group.trim().is_empty() {
                        return Err(CmdError::Submission("empty group name".to_string()));
                    }
                }
                Ok(())
            }
            Request::Delete2 { targets, .. } => {
                if targets.is_empty() {
                    return Err(CmdError::Submission("no delete targets".to_string()));
                }
                for (target_type, ids) in targets {
                    if ids.is_empty() {
                        return Err(CmdError::Submission(format!(
                            "no ids given for {target_type}"
                        )));
                    }
                    for id in ids {
                        check_target(target_type, *id)?;
                    }
                }
                Ok(())
            }
            Request::DoAll { requests } => {
                if requests.is_empty() {
                    return Err(CmdError::Submission("empty batch".to_string()));
                }
                requests.iter().try_for_each(Request::validate)
            }
        }
    }

    /// Whether `response` is a legal outcome for this request. Error
    /// outcomes pair with every request.
    pub fn accepts(&self, response: &Response) -> bool {
        match (self, response) {
            (_, Response::Err { .. }) => true,
            (Request::Delete { .. }, Response::DeleteRsp { .. }) => true,
            (Request::Delete2 { .. }, Response::Delete2Rsp { .. }) => true,
            (Request::Chgrp { .. }, Response::Ok) => true,
            (Request::DoAll { requests }, Response::DoAllRsp { responses }) => {
                requests.len() == responses.len()
                    && requests.iter().zip(responses).all(|(q, r)| q.accepts(r))
            }
            _ => false,
        }
    }
}

fn check_target(target_type: &str, id: i64) -> CmdResult<()> {
    if target_type.trim_start_matches('/').is_empty() {
        return Err(CmdError::Submission("empty target type".to_string()));
    }
    if id <= 0 {
        return Err(CmdError::Submission(format!(
            "invalid id {id} for {target_type}"
        )));
    }
    Ok(())
}

/// Discriminant of a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Ok,
    DeleteRsp,
    Delete2Rsp,
    DoAllRsp,
    Err,
}

/// Typed outcome of a completed request. Exactly one variant per completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    DeleteRsp {
        actual_deletes: u64,
        /// Non-fatal; empty when there is nothing to report.
        #[serde(default)]
        warning: String,
    },
    Delete2Rsp {
        deleted_objects: BTreeMap<String, Vec<i64>>,
    },
    DoAllRsp {
        responses: Vec<Response>,
    },
    Err {
        category: String,
        name: String,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
}

/// Borrowed view of a [`Response::DeleteRsp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReport<'a> {
    pub actual_deletes: u64,
    pub warning: &'a str,
}

impl DeleteReport<'_> {
    pub fn warning(&self) -> Option<&str> {
        (!self.warning.is_empty()).then_some(self.warning)
    }
}

impl Response {
    pub fn error(category: impl Into<String>, name: impl Into<String>) -> Self {
        Response::Err {
            category: category.into(),
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Ok => ResponseKind::Ok,
            Response::DeleteRsp { .. } => ResponseKind::DeleteRsp,
            Response::Delete2Rsp { .. } => ResponseKind::Delete2Rsp,
            Response::DoAllRsp { .. } => ResponseKind::DoAllRsp,
            Response::Err { .. } => ResponseKind::Err,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Response::Err { .. })
    }

    /// `None` when this is not a delete outcome.
    pub fn as_delete(&self) -> Option<DeleteReport<'_>> {
        match self {
            Response::DeleteRsp {
                actual_deletes,
                warning,
            } => Some(DeleteReport {
                actual_deletes: *actual_deletes,
                warning,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => write!(f, "OK"),
            Response::DeleteRsp {
                actual_deletes,
                warning,
            } => {
                write!(f, "deleted={actual_deletes}")?;
                if !warning.is_empty() {
                    write!(f, ", warning={warning}")?;
                }
                Ok(())
            }
            Response::Delete2Rsp { deleted_objects } => {
                let total: usize = deleted_objects.values().map(Vec::len).sum();
                write!(f, "deleted={total}")
            }
            Response::DoAllRsp { responses } => write!(f, "batch of {}", responses.len()),
            Response::Err { category, name, .. } => write!(f, "error={category}/{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFlag {
    Cancelled,
    Failure,
}

/// Progress snapshot reported by the service for one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub flags: Vec<StatusFlag>,
    pub steps: u32,
    pub current_step: u32,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

impl Status {
    pub fn new(steps: u32) -> Self {
        Self {
            flags: Vec::new(),
            steps,
            current_step: 0,
            start_time: Utc::now(),
            stop_time: None,
        }
    }

    pub fn has_flag(&self, flag: StatusFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn set_flag(&mut self, flag: StatusFlag) {
        if !self.has_flag(flag) {
            self.flags.push(flag);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_time.is_some()
    }
}
