use crate::directory::{Attributes, Directory, ModifyAction};
use crate::error::LdapError;
use crate::filter::Filter;
use crate::ldap_protocol::{Attribute, ModifyChange, ModifyOperation, SearchResultEntry, SearchScope};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// objectClass value an add request uses to create a user.
const ADD_CLASS_USER: &str = "inetOrgPerson";
/// objectClass value an add request uses to create a group. Lowercase, unlike the search side.
const ADD_CLASS_GROUP: &str = "groupofnames";

/// Turns one decoded LDAP operation into Directory calls.
pub struct LdapHandler {
    pub(crate) directory: Arc<Directory>,
}

impl LdapHandler {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn handle_bind(&self, version: i32, dn: &str, password: &str) -> Result<(), LdapError> {
        debug!("Handling BIND request: dn={}, version={}", dn, version);
        if dn.is_empty() {
            return Err(LdapError::InappropriateAuthentication(
                "This server does not support anonymous bind".to_string(),
            ));
        }
        if !self.directory.valid_credentials(dn, password) {
            return Err(LdapError::InvalidCredentials("Invalid credentials".to_string()));
        }
        info!("BIND successful for: {}", dn);
        Ok(())
    }

    /// Emits every matching user, then every matching group. Returns the number of entries emitted.
    pub fn handle_search<F>(
        &self,
        base: &str,
        scope: SearchScope,
        deref_aliases: i32,
        filter: &Filter,
        mut emit: F,
    ) -> Result<usize, LdapError>
    where
        F: FnMut(SearchResultEntry),
    {
        debug!(
            "Handling SEARCH request: base={}, scope={:?}, deref={}, filter={}",
            base,
            scope,
            deref_aliases,
            filter.to_ldap_string()
        );
        if filter.as_equality().is_none() {
            return Err(LdapError::UnwillingToPerform(format!(
                "Filter operator {} is not supported, only equalityMatch",
                filter.operator()
            )));
        }

        let users = self.directory.find_users(base, filter);
        let groups = self.directory.find_groups(base, filter);
        let count = users.len() + groups.len();

        for dn in users {
            let attributes = self.directory.user_attributes(&dn);
            emit(search_entry(dn, attributes));
        }
        for dn in groups {
            let attributes = self.directory.group_attributes(&dn);
            emit(search_entry(dn, attributes));
        }

        debug!("SEARCH returned {} entries", count);
        Ok(count)
    }

    /// Only the first objectClass value is considered; unknown classes are ignored.
    pub fn handle_add(&self, dn: &str, attributes: &[Attribute]) -> Result<(), LdapError> {
        debug!("Handling ADD request: dn={}", dn);
        let Some(object_class) = first_value(attributes, "objectclass") else {
            debug!("ADD ignored for {}: no objectclass", dn);
            return Ok(());
        };

        match object_class.as_str() {
            ADD_CLASS_USER => {
                let password = first_value(attributes, "userPassword").unwrap_or_default();
                let mail = first_value(attributes, "mail");
                self.directory.add_user(dn, &password, mail.as_deref());
                info!("ADD successful for user: {}", dn);
            }
            ADD_CLASS_GROUP => match first_value(attributes, "member") {
                Some(member) => {
                    self.directory.add_group_member(dn, &member);
                    info!("ADD successful for group: {}", dn);
                }
                None => debug!("ADD ignored for group {}: no member", dn),
            },
            other => debug!("ADD ignored for {}: objectclass {}", dn, other),
        }
        Ok(())
    }

    /// Applies the first value of the first change; further changes are not supported.
    pub fn handle_modify(&self, dn: &str, changes: &[ModifyChange]) -> Result<(), LdapError> {
        debug!("Handling MODIFY request: dn={}", dn);
        let Some(change) = changes.first() else {
            return Ok(());
        };
        if changes.len() > 1 {
            warn!("MODIFY for {} carries {} changes, only the first is applied", dn, changes.len());
        }

        let attribute = &change.modification.attr_type;
        let Some(value) = change.modification.first_value() else {
            debug!("MODIFY ignored for {}: {} has no value", dn, attribute);
            return Ok(());
        };
        let action = match change.operation {
            ModifyOperation::Add => ModifyAction::Add,
            ModifyOperation::Delete => ModifyAction::Delete,
            ModifyOperation::Replace => ModifyAction::Replace,
        };

        self.directory.modify_entry(dn, attribute, action, &value);
        info!("MODIFY successful for: {} ({} {:?})", dn, attribute, action);
        Ok(())
    }

    pub fn handle_delete(&self, dn: &str) -> Result<(), LdapError> {
        debug!("Handling DELETE request: dn={}", dn);
        self.directory.delete_entry(dn);
        info!("DELETE successful for: {}", dn);
        Ok(())
    }

    /// Same as `handle_delete`; some clients name the operation "del".
    pub fn handle_del(&self, dn: &str) -> Result<(), LdapError> {
        self.handle_delete(dn)
    }
}

/// First value of the attribute named `name` (case-insensitive).
fn first_value(attributes: &[Attribute], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|attr| attr.attr_type.eq_ignore_ascii_case(name))
        .and_then(Attribute::first_value)
}

fn search_entry(dn: String, attributes: Attributes) -> SearchResultEntry {
    SearchResultEntry {
        object_name: dn,
        attributes: attributes
            .into_iter()
            .map(|(name, values)| Attribute::new(name, &values))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DISCLAIMER, GROUP_OF_NAMES};

    const DOMAIN: &str = "dc=example,dc=com";
    const REGULAR_DN: &str = "cn=regular_user,ou=USERS,dc=example,dc=com";
    const GROUP_DN: &str = "cn=regular_group,ou=GROUPS,dc=example,dc=com";

    fn handler() -> LdapHandler {
        let directory = Arc::new(Directory::new());
        directory.add_user(REGULAR_DN, "regular_password", Some("regular_user@example.com"));
        LdapHandler::new(directory)
    }

    fn attr(name: &str, value: &str) -> Attribute {
        Attribute::new(name, &[value.to_string()])
    }

    fn change(operation: ModifyOperation, name: &str, value: &str) -> ModifyChange {
        ModifyChange {
            operation,
            modification: attr(name, value),
        }
    }

    fn search(handler: &LdapHandler, base: &str, filter: &Filter) -> Result<Vec<SearchResultEntry>, LdapError> {
        let mut entries = Vec::new();
        handler.handle_search(base, SearchScope::WholeSubtree, 0, filter, |e| entries.push(e))?;
        Ok(entries)
    }

    #[test]
    fn test_bind_anonymous() {
        let h = handler();
        assert_eq!(
            h.handle_bind(3, "", "anything"),
            Err(LdapError::InappropriateAuthentication(
                "This server does not support anonymous bind".to_string()
            ))
        );
    }

    #[test]
    fn test_bind_credentials() {
        let h = handler();
        assert!(h.handle_bind(3, REGULAR_DN, "regular_password").is_ok());
        assert!(matches!(
            h.handle_bind(3, REGULAR_DN, "wrong"),
            Err(LdapError::InvalidCredentials(_))
        ));
        assert!(matches!(
            h.handle_bind(3, "cn=nobody,dc=example,dc=com", "regular_password"),
            Err(LdapError::InvalidCredentials(_))
        ));
    }

    #[test]
    fn test_search_rejects_non_equality() {
        let h = handler();
        let filter = Filter::Substrings {
            attribute: "cn".to_string(),
            initial: Some("regular_user".to_string()),
            any: vec![],
            last: None,
        };
        let err = search(&h, DOMAIN, &filter).unwrap_err();
        assert_eq!(err.result_code(), 53);
        assert!(matches!(
            search(&h, DOMAIN, &Filter::And(vec![Filter::equality("cn", "regular_user")])),
            Err(LdapError::UnwillingToPerform(_))
        ));
    }

    #[test]
    fn test_search_user_by_cn() {
        let h = handler();
        let entries = search(&h, DOMAIN, &Filter::equality("cn", "regular_user")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_name, REGULAR_DN);
        let names: Vec<&str> = entries[0].attributes.iter().map(|a| a.attr_type.as_str()).collect();
        assert_eq!(names, vec!["cn", "disclaimer", "mail", "regular_password"]);
        let disclaimer = entries[0].attributes.iter().find(|a| a.attr_type == "disclaimer").unwrap();
        assert_eq!(disclaimer.first_value().as_deref(), Some(DISCLAIMER));

        assert!(search(&h, "dc=wrongdomain,dc=com", &Filter::equality("cn", "regular_user"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_search_users_before_groups() {
        let h = handler();
        h.directory.add_group_member(GROUP_DN, REGULAR_DN);
        let entries = search(&h, GROUP_DN, &Filter::equality("member", REGULAR_DN)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_name, REGULAR_DN);
        // the member DN is a user, not a group, so it carries no group attributes
        assert!(entries[0].attributes.is_empty());

        let groups = search(&h, "", &Filter::equality("objectClass", GROUP_OF_NAMES)).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].object_name, GROUP_DN);
        assert_eq!(groups[0].attributes[1].attr_type, "member");
    }

    #[test]
    fn test_add_user_and_group() {
        let h = handler();
        let addable = "cn=addable_user,ou=USERS,dc=example,dc=com";
        h.handle_add(
            addable,
            &[
                attr("objectclass", "inetOrgPerson"),
                attr("userPassword", "addable_password"),
                attr("mail", "addable_user@example.com"),
            ],
        )
        .unwrap();
        assert!(h.handle_bind(3, addable, "addable_password").is_ok());

        let group = "cn=addable_group,ou=GROUPS,dc=example,dc=com";
        h.handle_add(group, &[attr("objectclass", "groupofnames"), attr("member", addable)])
            .unwrap();
        let members = search(&h, group, &Filter::equality("cn", "addable_group")).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].object_name, addable);
    }

    #[test]
    fn test_add_class_value_is_case_sensitive() {
        let h = handler();
        h.handle_add("cn=g,dc=example,dc=com", &[attr("objectClass", "groupOfNames"), attr("member", "cn=x")])
            .unwrap();
        h.handle_add("cn=u,dc=example,dc=com", &[attr("objectClass", "person"), attr("userPassword", "p")])
            .unwrap();
        assert_eq!(h.directory.group_count(), 0);
        assert_eq!(h.directory.user_count(), 1);
    }

    #[test]
    fn test_add_user_without_password() {
        let h = handler();
        h.handle_add("cn=nopw,dc=example,dc=com", &[attr("objectclass", "inetOrgPerson")])
            .unwrap();
        assert!(h.handle_bind(3, "cn=nopw,dc=example,dc=com", "").is_ok());
    }

    #[test]
    fn test_modify_mail() {
        let h = handler();
        h.handle_modify(REGULAR_DN, &[change(ModifyOperation::Replace, "mail", "new@example.com")])
            .unwrap();
        assert_eq!(search(&h, DOMAIN, &Filter::equality("mail", "new@example.com")).unwrap().len(), 1);
        assert!(search(&h, DOMAIN, &Filter::equality("mail", "regular_user@example.com"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_modify_group_member_add_delete() {
        let h = handler();
        h.directory.add_group_member(GROUP_DN, REGULAR_DN);
        let other = "cn=other,ou=USERS,dc=example,dc=com";
        h.handle_modify(GROUP_DN, &[change(ModifyOperation::Add, "member", other)]).unwrap();
        assert_eq!(search(&h, GROUP_DN, &Filter::equality("member", other)).unwrap().len(), 1);
        h.handle_modify(GROUP_DN, &[change(ModifyOperation::Delete, "member", other)]).unwrap();
        assert!(search(&h, GROUP_DN, &Filter::equality("member", other)).unwrap().is_empty());
    }

    #[test]
    fn test_modify_applies_first_change_only() {
        let h = handler();
        h.handle_modify(
            REGULAR_DN,
            &[
                change(ModifyOperation::Replace, "userPassword", "first"),
                change(ModifyOperation::Replace, "userPassword", "second"),
            ],
        )
        .unwrap();
        assert!(h.handle_bind(3, REGULAR_DN, "first").is_ok());
        assert!(h.handle_modify(REGULAR_DN, &[]).is_ok());
    }

    #[test]
    fn test_delete_and_del_alias() {
        let h = handler();
        h.directory.add_group_member(GROUP_DN, REGULAR_DN);
        h.handle_delete(REGULAR_DN).unwrap();
        h.handle_del(GROUP_DN).unwrap();
        h.handle_del("cn=never,dc=example,dc=com").unwrap();
        assert_eq!(h.directory.user_count(), 0);
        assert_eq!(h.directory.group_count(), 0);
    }
}
