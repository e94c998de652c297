//! Cluster membership and its fixed-layout native form.
//!
//! Recovery hands the engine an array of [`NodeInfoExt`] records whose
//! `address` fields point at C strings. [`RawMembership`] owns both the
//! strings and the array for the duration of the call and frees them on
//! drop, whichever way the call ends.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ffi::{self, NodeInfoExt};

/// Participation class of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full voting member.
    #[default]
    Voter,
    /// Replicates the log but does not vote.
    StandBy,
    /// Neither replicates nor votes.
    Spare,
}

impl Role {
    /// Numeric code used by the engine.
    pub const fn code(self) -> u64 {
        match self {
            Self::Voter => ffi::DQLITE_VOTER,
            Self::StandBy => ffi::DQLITE_STANDBY,
            Self::Spare => ffi::DQLITE_SPARE,
        }
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            ffi::DQLITE_VOTER => Some(Self::Voter),
            ffi::DQLITE_STANDBY => Some(Self::StandBy),
            ffi::DQLITE_SPARE => Some(Self::Spare),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Voter => write!(f, "voter"),
            Role::StandBy => write!(f, "standby"),
            Role::Spare => write!(f, "spare"),
        }
    }
}

/// One member of a cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub role: Role,
}

impl NodeInfo {
    pub fn new(id: u64, address: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }

    pub fn voter(id: u64, address: impl Into<String>) -> Self {
        Self::new(id, address, Role::Voter)
    }
}

/// Ways a membership list can be unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("membership list is empty")]
    Empty,

    #[error("node id {0} appears more than once")]
    DuplicateId(u64),

    #[error("node {0} has an empty address")]
    EmptyAddress(u64),

    #[error("address of node {0} contains a NUL byte")]
    NulInAddress(u64),

    #[error("node {id} has unknown role code {code}")]
    UnknownRole { id: u64, code: u64 },

    #[error("record for node {0} has a null address")]
    NullAddress(u64),

    #[error("record for node {0} has a non UTF-8 address")]
    InvalidAddress(u64),

    #[error("record for node {id} has size {size}, expected {expected}")]
    RecordSize { id: u64, size: u64, expected: u64 },
}

/// Check the list invariants: non-empty, unique ids, non-empty addresses.
pub fn validate(cluster: &[NodeInfo]) -> Result<(), MembershipError> {
    if cluster.is_empty() {
        return Err(MembershipError::Empty);
    }
    let mut ids = HashSet::with_capacity(cluster.len());
    for info in cluster {
        if !ids.insert(info.id) {
            return Err(MembershipError::DuplicateId(info.id));
        }
        if info.address.is_empty() {
            return Err(MembershipError::EmptyAddress(info.id));
        }
    }
    Ok(())
}

/// The same list with every role reset to [`Role::Voter`].
pub fn with_default_role(cluster: &[NodeInfo]) -> Vec<NodeInfo> {
    cluster
        .iter()
        .map(|info| NodeInfo {
            role: Role::Voter,
            ..info.clone()
        })
        .collect()
}

/// Owned native representation of a membership list.
///
/// The records borrow from `addresses` through raw pointers, so both live
/// and die together.
pub struct RawMembership {
    infos: Vec<NodeInfoExt>,
    _addresses: Vec<CString>,
}

impl RawMembership {
    /// Validate `cluster` and lay it out as engine records, in list order.
    pub fn build(cluster: &[NodeInfo]) -> Result<Self, MembershipError> {
        validate(cluster)?;

        let addresses = cluster
            .iter()
            .map(|info| {
                CString::new(info.address.as_str())
                    .map_err(|_| MembershipError::NulInAddress(info.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Moving a CString does not move its heap buffer, so these pointers
        // stay valid for as long as `addresses` is alive.
        let infos = cluster
            .iter()
            .zip(&addresses)
            .map(|(info, address)| NodeInfoExt {
                size: std::mem::size_of::<NodeInfoExt>() as u64,
                id: info.id,
                address: address.as_ptr() as usize as u64,
                dqlite_role: info.role.code(),
            })
            .collect::<Vec<_>>();

        debug!(members = infos.len(), "marshaled membership");
        Ok(Self {
            infos,
            _addresses: addresses,
        })
    }

    pub fn as_slice(&self) -> &[NodeInfoExt] {
        &self.infos
    }

    /// Mutable view for engine calls that take a non-const array.
    pub fn as_mut_slice(&mut self) -> &mut [NodeInfoExt] {
        &mut self.infos
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Read engine records back into owned [`NodeInfo`] values.
///
/// # Safety
///
/// Every non-null `address` in `infos` must point to a NUL-terminated string
/// that stays valid for the duration of the call.
pub unsafe fn decode(infos: &[NodeInfoExt]) -> Result<Vec<NodeInfo>, MembershipError> {
    let expected = std::mem::size_of::<NodeInfoExt>() as u64;
    infos
        .iter()
        .map(|raw| {
            if raw.size != expected {
                return Err(MembershipError::RecordSize {
                    id: raw.id,
                    size: raw.size,
                    expected,
                });
            }
            if raw.address == 0 {
                return Err(MembershipError::NullAddress(raw.id));
            }
            let role = Role::from_code(raw.dqlite_role).ok_or(MembershipError::UnknownRole {
                id: raw.id,
                code: raw.dqlite_role,
            })?;
            // SAFETY: non-null, and the caller guarantees NUL termination.
            let address = unsafe { CStr::from_ptr(raw.address as usize as *const c_char) }
                .to_str()
                .map_err(|_| MembershipError::InvalidAddress(raw.id))?;
            Ok(NodeInfo::new(raw.id, address, role))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> Vec<NodeInfo> {
        vec![
            NodeInfo::voter(1, "10.0.0.1:9000"),
            NodeInfo::voter(2, "10.0.0.2:9000"),
            NodeInfo::new(3, "10.0.0.3:9000", Role::Spare),
        ]
    }

    #[test]
    fn role_codes_round_trip() {
        for role in [Role::Voter, Role::StandBy, Role::Spare] {
            assert_eq!(Role::from_code(role.code()), Some(role));
        }
        assert_eq!(Role::StandBy.code(), 1);
        assert_eq!(Role::from_code(3), None);
    }

    #[test]
    fn build_preserves_order_and_roles() {
        let cluster = three_members();
        let raw = RawMembership::build(&cluster).unwrap();
        assert_eq!(raw.len(), 3);
        assert!(!raw.is_empty());

        let ids: Vec<u64> = raw.as_slice().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(raw.as_slice()[2].dqlite_role, ffi::DQLITE_SPARE);
        assert!(raw.as_slice().iter().all(|r| r.size == 32));
    }

    #[test]
    fn build_then_decode_matches_input() {
        let cluster = three_members();
        let raw = RawMembership::build(&cluster).unwrap();
        let decoded = unsafe { decode(raw.as_slice()) }.unwrap();
        assert_eq!(decoded, cluster);
    }

    #[test]
    fn empty_list_is_rejected() {
        assert_eq!(RawMembership::build(&[]).err(), Some(MembershipError::Empty));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let cluster = vec![NodeInfo::voter(1, "a:1"), NodeInfo::voter(1, "b:1")];
        assert_eq!(validate(&cluster), Err(MembershipError::DuplicateId(1)));
    }

    #[test]
    fn empty_and_nul_addresses_are_rejected() {
        assert_eq!(
            validate(&[NodeInfo::voter(4, "")]),
            Err(MembershipError::EmptyAddress(4))
        );
        assert_eq!(
            RawMembership::build(&[NodeInfo::voter(5, "a\0b")]).err(),
            Some(MembershipError::NulInAddress(5))
        );
    }

    #[test]
    fn default_role_resets_everyone_to_voter() {
        let voters = with_default_role(&three_members());
        assert!(voters.iter().all(|n| n.role == Role::Voter));
        assert_eq!(voters[2].address, "10.0.0.3:9000");
    }

    #[test]
    fn decode_rejects_bad_role_and_null_address() {
        let address = CString::new("x:1").unwrap();
        let mut record = NodeInfoExt {
            size: 32,
            id: 9,
            address: address.as_ptr() as usize as u64,
            dqlite_role: 7,
        };
        assert_eq!(
            unsafe { decode(&[record]) },
            Err(MembershipError::UnknownRole { id: 9, code: 7 })
        );

        record.dqlite_role = 0;
        record.address = 0;
        assert_eq!(unsafe { decode(&[record]) }, Err(MembershipError::NullAddress(9)));
    }

    #[test]
    fn role_deserializes_from_lowercase() {
        let info: NodeInfo =
            serde_json::from_str(r#"{"id":7,"address":"h:1","role":"standby"}"#).unwrap();
        assert_eq!(info.role, Role::StandBy);
        assert_eq!(info.role.to_string(), "standby");

        let info: NodeInfo = serde_json::from_str(r#"{"id":7,"address":"h:1"}"#).unwrap();
        assert_eq!(info.role, Role::Voter);
    }
}
