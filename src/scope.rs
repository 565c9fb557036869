//! Visibility rules for every target operation.
//!
//! Admins see everything, leaders see themselves plus the salespeople granted to
//! them, salespeople see only themselves. Channels and distributors inherit the
//! visibility of the user who owns them.

use crate::errors::{AppError, AppResult};
use crate::models::{CallerContext, DistributorTarget, Role, SubjectType, Target};
use std::collections::BTreeSet;
use std::fmt;

/// Read access to the subject directory and the leader grant edges.
pub trait ScopeSource {
    fn all_user_ids(&self) -> AppResult<Vec<String>>;
    fn granted_salesperson_ids(&self, leader_id: &str) -> AppResult<Vec<String>>;
    fn has_grant(&self, leader_id: &str, salesperson_id: &str) -> AppResult<bool>;
    fn channel_owner(&self, channel_id: &str) -> AppResult<Option<String>>;
    fn distributor_owner(&self, distributor_id: &str) -> AppResult<Option<String>>;
    fn distributor_ids_owned_by(&self, owner_ids: &BTreeSet<String>) -> AppResult<Vec<String>>;
    fn all_distributor_ids(&self) -> AppResult<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectRef<'a> {
    Person(&'a str),
    Channel(&'a str),
    Distributor(&'a str),
}

impl<'a> SubjectRef<'a> {
    pub fn of_target(target: &'a Target) -> Self {
        Self::for_subject(target.subject_type, &target.subject_id)
    }

    pub fn of_distributor_target(target: &'a DistributorTarget) -> Self {
        Self::Distributor(&target.distributor_id)
    }

    pub fn for_subject(subject_type: SubjectType, subject_id: &'a str) -> Self {
        match subject_type {
            SubjectType::Person => Self::Person(subject_id),
            SubjectType::Channel => Self::Channel(subject_id),
        }
    }
}

/// What a write touches. Only achievement updates are open to the subject's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Quota,
    Achievement,
    Allocate,
    Delete,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Quota => "modify quotas of",
            Self::Achievement => "record achievement on",
            Self::Allocate => "allocate",
            Self::Delete => "delete",
        };
        f.write_str(label)
    }
}

pub struct ScopeResolver<'a, S: ScopeSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: ScopeSource + ?Sized> ScopeResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// User ids the caller may read or write targets for.
    pub fn accessible_subject_ids(&self, caller: &CallerContext) -> AppResult<BTreeSet<String>> {
        match caller.role {
            Role::Admin => Ok(self.source.all_user_ids()?.into_iter().collect()),
            Role::Leader => {
                let mut ids: BTreeSet<String> = self
                    .source
                    .granted_salesperson_ids(&caller.user_id)?
                    .into_iter()
                    .collect();
                ids.insert(caller.user_id.clone());
                Ok(ids)
            }
            Role::Salesperson => Ok(BTreeSet::from([caller.user_id.clone()])),
        }
    }

    pub fn accessible_distributor_ids(&self, caller: &CallerContext) -> AppResult<BTreeSet<String>> {
        let ids = match caller.role {
            Role::Admin => self.source.all_distributor_ids()?,
            _ => {
                let owners = self.accessible_subject_ids(caller)?;
                self.source.distributor_ids_owned_by(&owners)?
            }
        };
        Ok(ids.into_iter().collect())
    }

    pub fn can_access_user(&self, caller: &CallerContext, user_id: &str) -> AppResult<bool> {
        if caller.role == Role::Admin || caller.user_id == user_id {
            return Ok(true);
        }
        match caller.role {
            Role::Leader => self.source.has_grant(&caller.user_id, user_id),
            _ => Ok(false),
        }
    }

    pub fn can_access(&self, caller: &CallerContext, subject: SubjectRef<'_>) -> AppResult<bool> {
        if caller.role == Role::Admin {
            return Ok(true);
        }
        match self.owner_of(subject)? {
            Some(owner) => self.can_access_user(caller, &owner),
            None => Ok(false),
        }
    }

    pub fn is_owner(&self, caller: &CallerContext, subject: SubjectRef<'_>) -> AppResult<bool> {
        Ok(self.owner_of(subject)?.as_deref() == Some(caller.user_id.as_str()))
    }

    /// Out-of-scope subjects are reported as missing so their existence does not leak.
    pub fn require_visible(&self, caller: &CallerContext, subject: SubjectRef<'_>, label: &str) -> AppResult<()> {
        if self.can_access(caller, subject)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("{} not found", label)))
        }
    }

    pub fn require_write(
        &self,
        caller: &CallerContext,
        subject: SubjectRef<'_>,
        mutation: Mutation,
        label: &str,
    ) -> AppResult<()> {
        self.require_visible(caller, subject, label)?;
        if caller.role.manages_quotas() {
            return Ok(());
        }
        if mutation == Mutation::Achievement && self.is_owner(caller, subject)? {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "{} may not {} {}",
            caller.role.as_str(),
            mutation,
            label
        )))
    }

    fn owner_of(&self, subject: SubjectRef<'_>) -> AppResult<Option<String>> {
        match subject {
            SubjectRef::Person(user_id) => Ok(Some(user_id.to_string())),
            SubjectRef::Channel(channel_id) => self.source.channel_owner(channel_id),
            SubjectRef::Distributor(distributor_id) => self.source.distributor_owner(distributor_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Directory {
        users: Vec<String>,
        grants: BTreeSet<(String, String)>,
        channels: BTreeMap<String, String>,
        distributors: BTreeMap<String, String>,
    }

    impl ScopeSource for Directory {
        fn all_user_ids(&self) -> AppResult<Vec<String>> {
            Ok(self.users.clone())
        }

        fn granted_salesperson_ids(&self, leader_id: &str) -> AppResult<Vec<String>> {
            Ok(self
                .grants
                .iter()
                .filter(|(leader, _)| leader == leader_id)
                .map(|(_, salesperson)| salesperson.clone())
                .collect())
        }

        fn has_grant(&self, leader_id: &str, salesperson_id: &str) -> AppResult<bool> {
            Ok(self
                .grants
                .contains(&(leader_id.to_string(), salesperson_id.to_string())))
        }

        fn channel_owner(&self, channel_id: &str) -> AppResult<Option<String>> {
            Ok(self.channels.get(channel_id).cloned())
        }

        fn distributor_owner(&self, distributor_id: &str) -> AppResult<Option<String>> {
            Ok(self.distributors.get(distributor_id).cloned())
        }

        fn distributor_ids_owned_by(&self, owner_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
            Ok(self
                .distributors
                .iter()
                .filter(|(_, owner)| owner_ids.contains(*owner))
                .map(|(id, _)| id.clone())
                .collect())
        }

        fn all_distributor_ids(&self) -> AppResult<Vec<String>> {
            Ok(self.distributors.keys().cloned().collect())
        }
    }

    fn directory() -> Directory {
        let mut directory = Directory {
            users: ["admin", "l1", "l2", "s1", "s2", "s3"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            ..Directory::default()
        };
        directory.grants.insert(("l1".to_string(), "s1".to_string()));
        directory.grants.insert(("l1".to_string(), "s2".to_string()));
        directory.grants.insert(("l2".to_string(), "s3".to_string()));
        directory.channels.insert("ch-1".to_string(), "s1".to_string());
        directory.distributors.insert("d-1".to_string(), "s1".to_string());
        directory.distributors.insert("d-2".to_string(), "s2".to_string());
        directory.distributors.insert("d-3".to_string(), "s3".to_string());
        directory
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn leader_scope_is_self_plus_grants() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let scope = resolver
            .accessible_subject_ids(&CallerContext::leader("l1"))
            .expect("resolve scope");
        assert_eq!(scope, ids(&["l1", "s1", "s2"]));
    }

    #[test]
    fn salesperson_scope_is_only_self() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let scope = resolver
            .accessible_subject_ids(&CallerContext::salesperson("s1"))
            .expect("resolve scope");
        assert_eq!(scope, ids(&["s1"]));
    }

    #[test]
    fn admin_scope_is_every_user() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let scope = resolver
            .accessible_subject_ids(&CallerContext::admin("admin"))
            .expect("resolve scope");
        assert_eq!(scope, ids(&["admin", "l1", "l2", "s1", "s2", "s3"]));
    }

    #[test]
    fn channels_and_distributors_follow_their_owner() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let l1 = CallerContext::leader("l1");
        let l2 = CallerContext::leader("l2");

        assert!(resolver.can_access(&l1, SubjectRef::Channel("ch-1")).expect("check"));
        assert!(!resolver.can_access(&l2, SubjectRef::Channel("ch-1")).expect("check"));
        assert!(!resolver.can_access(&l1, SubjectRef::Channel("unknown")).expect("check"));
        assert_eq!(
            resolver.accessible_distributor_ids(&l1).expect("distributors"),
            ids(&["d-1", "d-2"])
        );
        assert_eq!(
            resolver
                .accessible_distributor_ids(&CallerContext::admin("admin"))
                .expect("distributors"),
            ids(&["d-1", "d-2", "d-3"])
        );
    }

    #[test]
    fn hidden_subjects_read_as_not_found() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let error = resolver
            .require_visible(&CallerContext::leader("l2"), SubjectRef::Person("s1"), "Target t-1")
            .expect_err("l2 cannot see s1");
        assert!(matches!(error, AppError::NotFound(_)));
    }

    #[test]
    fn salesperson_may_record_own_achievement_but_not_quota() {
        let directory = directory();
        let resolver = ScopeResolver::new(&directory);
        let s1 = CallerContext::salesperson("s1");

        resolver
            .require_write(&s1, SubjectRef::Person("s1"), Mutation::Achievement, "Target t-1")
            .expect("owner may record achievement");
        resolver
            .require_write(&s1, SubjectRef::Distributor("d-1"), Mutation::Achievement, "Distributor target")
            .expect("distributor owner may record achievement");

        let error = resolver
            .require_write(&s1, SubjectRef::Person("s1"), Mutation::Quota, "Target t-1")
            .expect_err("salesperson cannot edit quota");
        assert!(matches!(error, AppError::Forbidden(_)));

        let error = resolver
            .require_write(&s1, SubjectRef::Person("s2"), Mutation::Achievement, "Target t-2")
            .expect_err("other salesperson is hidden");
        assert!(matches!(error, AppError::NotFound(_)));
    }
}
