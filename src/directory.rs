//! In-memory directory: users (credential + mail) and groups (member lists).
//!
//! Nothing here fails. Unknown DNs, unknown attributes and duplicate members
//! resolve to empty results or no-ops, which is what the test suites relying on
//! this server expect from it.

use crate::config::DirectoryConfig;
use crate::filter::Filter;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// objectClass value that selects users in a search.
pub const INET_ORG_PERSON: &str = "inetOrgPerson";
/// objectClass value that selects groups in a search.
pub const GROUP_OF_NAMES: &str = "groupOfNames";

pub const DISCLAIMER: &str = "This entry is served by fakeldap and exists for testing only";

/// Attribute name -> values, as returned to the client for one entry.
pub type Attributes = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub password: String,
    pub mail: Option<String>,
}

/// Member DNs in insertion order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    members: Vec<String>,
}

impl Group {
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    fn add_member(&mut self, member: &str) {
        if !self.contains(member) {
            self.members.push(member.to_string());
        }
    }

    fn remove_member(&mut self, member: &str) {
        self.members.retain(|m| m != member);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Default)]
struct Entries {
    users: BTreeMap<String, User>,
    groups: BTreeMap<String, Group>,
}

/// Shared store handed to every request handler. A single lock covers reads and writes.
#[derive(Debug, Default)]
pub struct Directory {
    entries: RwLock<Entries>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the users and group memberships listed in the config.
    pub fn seed(&self, config: &DirectoryConfig) {
        for user in &config.users {
            self.add_user(&user.dn, &user.password, user.mail.as_deref());
        }
        for group in &config.groups {
            for member in &group.members {
                self.add_group_member(&group.dn, member);
            }
        }
        debug!(
            "Seeded directory with {} users and {} groups",
            config.users.len(),
            config.groups.len()
        );
    }

    /// Inserts or overwrites the user at `dn`. A group at the same DN is replaced.
    pub fn add_user(&self, dn: &str, password: &str, mail: Option<&str>) {
        let mut entries = self.entries.write();
        entries.groups.remove(dn);
        entries.users.insert(
            dn.to_string(),
            User {
                password: password.to_string(),
                mail: mail.map(str::to_string),
            },
        );
    }

    /// Creates the group when absent, then appends `member_dn` unless already present.
    pub fn add_group_member(&self, group_dn: &str, member_dn: &str) {
        let mut entries = self.entries.write();
        entries.users.remove(group_dn);
        entries
            .groups
            .entry(group_dn.to_string())
            .or_default()
            .add_member(member_dn);
    }

    /// Applies one attribute change. Users are looked up before groups; an unknown
    /// DN or an attribute the entry does not carry is ignored.
    pub fn modify_entry(&self, dn: &str, attribute: &str, action: ModifyAction, value: &str) {
        let mut entries = self.entries.write();
        if let Some(user) = entries.users.get_mut(dn) {
            // password and mail are single-valued: every action replaces
            if attribute.eq_ignore_ascii_case("password") || attribute.eq_ignore_ascii_case("userPassword") {
                user.password = value.to_string();
            } else if attribute.eq_ignore_ascii_case("mail") {
                user.mail = Some(value.to_string());
            }
            return;
        }
        if let Some(group) = entries.groups.get_mut(dn) {
            if attribute.eq_ignore_ascii_case("member") {
                match action {
                    ModifyAction::Add => group.add_member(value),
                    ModifyAction::Delete => group.remove_member(value),
                    ModifyAction::Replace => {}
                }
            }
        }
    }

    pub fn delete_entry(&self, dn: &str) {
        let mut entries = self.entries.write();
        if entries.users.remove(dn).is_none() {
            entries.groups.remove(dn);
        }
    }

    pub fn valid_credentials(&self, dn: &str, password: &str) -> bool {
        self.entries
            .read()
            .users
            .get(dn)
            .is_some_and(|user| user.password == password)
    }

    /// User DNs matching an equality filter. Non-equality filters match nothing.
    ///
    /// - `objectClass=inetOrgPerson`: every user, regardless of `base_dn`.
    /// - `cn=<v>`: users whose DN ends with `base_dn` and has a literal `cn=<v>` component.
    /// - `mail=<v>`: users whose stored mail is exactly `<v>`.
    pub fn find_users(&self, base_dn: &str, filter: &Filter) -> Vec<String> {
        let Some((attribute, value)) = filter.as_equality() else {
            return Vec::new();
        };
        let entries = self.entries.read();

        if attribute.eq_ignore_ascii_case("objectClass") {
            if value == INET_ORG_PERSON {
                return entries.users.keys().cloned().collect();
            }
            return Vec::new();
        }
        if attribute.eq_ignore_ascii_case("cn") {
            let rdn = format!("cn={}", value);
            return entries
                .users
                .keys()
                .filter(|dn| dn.ends_with(base_dn) && dn.split(',').any(|component| component == rdn))
                .cloned()
                .collect();
        }
        if attribute.eq_ignore_ascii_case("mail") {
            return entries
                .users
                .iter()
                .filter(|(_, user)| user.mail.as_deref() == Some(value))
                .map(|(dn, _)| dn.clone())
                .collect();
        }
        Vec::new()
    }

    /// Group DNs or member values matching an equality filter.
    ///
    /// - `objectClass=groupOfNames`: every group DN.
    /// - `cn=<anything>`: the members of the group keyed exactly by `base_dn`.
    /// - `member=<v>`: `[v]` when the `base_dn` group has `v` as a member. When `v` is the
    ///   literal `groupOfNames`, every group DN is appended as well.
    pub fn find_groups(&self, base_dn: &str, filter: &Filter) -> Vec<String> {
        let Some((attribute, value)) = filter.as_equality() else {
            return Vec::new();
        };
        let entries = self.entries.read();

        if attribute.eq_ignore_ascii_case("objectClass") {
            if value == GROUP_OF_NAMES {
                return entries.groups.keys().cloned().collect();
            }
            return Vec::new();
        }
        if attribute.eq_ignore_ascii_case("cn") {
            return entries
                .groups
                .get(base_dn)
                .map(|group| group.members.clone())
                .unwrap_or_default();
        }
        if attribute.eq_ignore_ascii_case("member") {
            let mut found = Vec::new();
            if entries.groups.get(base_dn).is_some_and(|group| group.contains(value)) {
                found.push(value.to_string());
            }
            if value == GROUP_OF_NAMES {
                found.extend(entries.groups.keys().cloned());
            }
            return found;
        }
        Vec::new()
    }

    /// Attributes of the user at `dn`; empty when there is no such user.
    pub fn user_attributes(&self, dn: &str) -> Attributes {
        let entries = self.entries.read();
        let mut attrs = Attributes::new();
        if let Some(user) = entries.users.get(dn) {
            attrs.insert("cn".to_string(), vec![dn.to_string()]);
            attrs.insert("regular_password".to_string(), vec![user.password.clone()]);
            if let Some(mail) = &user.mail {
                attrs.insert("mail".to_string(), vec![mail.clone()]);
            }
            attrs.insert("disclaimer".to_string(), vec![DISCLAIMER.to_string()]);
        }
        attrs
    }

    /// Attributes of the group at `dn`; empty when there is no such group.
    pub fn group_attributes(&self, dn: &str) -> Attributes {
        let entries = self.entries.read();
        let mut attrs = Attributes::new();
        if let Some(group) = entries.groups.get(dn) {
            attrs.insert("cn".to_string(), vec![dn.to_string()]);
            attrs.insert("member".to_string(), group.members.clone());
        }
        attrs
    }

    pub fn user_count(&self) -> usize {
        self.entries.read().users.len()
    }

    pub fn group_count(&self) -> usize {
        self.entries.read().groups.len()
    }
}
