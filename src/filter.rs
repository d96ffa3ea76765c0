//! Search filters as decoded from a SearchRequest (RFC 4511, section 4.5.1.7).
//!
//! The directory only answers equality assertions; the other variants exist so
//! the handler can recognise and refuse them.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: String },
    Substrings {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
    Present(String),
    Approx { attribute: String, value: String },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: String,
        dn_attributes: bool,
    },
}

impl Filter {
    pub fn equality(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// `(attribute, value)` when this is an equality assertion.
    pub fn as_equality(&self) -> Option<(&str, &str)> {
        match self {
            Filter::Equality { attribute, value } => Some((attribute, value)),
            _ => None,
        }
    }

    /// ASN.1 choice name of the filter, used in diagnostics.
    pub fn operator(&self) -> &'static str {
        match self {
            Filter::And(_) => "and",
            Filter::Or(_) => "or",
            Filter::Not(_) => "not",
            Filter::Equality { .. } => "equalityMatch",
            Filter::Substrings { .. } => "substrings",
            Filter::GreaterOrEqual { .. } => "greaterOrEqual",
            Filter::LessOrEqual { .. } => "lessOrEqual",
            Filter::Present(_) => "present",
            Filter::Approx { .. } => "approxMatch",
            Filter::Extensible { .. } => "extensibleMatch",
        }
    }

    /// String form (RFC 4515 shape, values unescaped) for logging.
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And(filters) => format!("(&{})", join(filters)),
            Filter::Or(filters) => format!("(|{})", join(filters)),
            Filter::Not(inner) => format!("(!{})", inner.to_ldap_string()),
            Filter::Equality { attribute, value } => format!("({}={})", attribute, value),
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            } => {
                let mut pattern = initial.clone().unwrap_or_default();
                pattern.push('*');
                for part in any {
                    pattern.push_str(part);
                    pattern.push('*');
                }
                if let Some(last) = last {
                    pattern.push_str(last);
                }
                format!("({}={})", attribute, pattern)
            }
            Filter::GreaterOrEqual { attribute, value } => format!("({}>={})", attribute, value),
            Filter::LessOrEqual { attribute, value } => format!("({}<={})", attribute, value),
            Filter::Present(attribute) => format!("({}=*)", attribute),
            Filter::Approx { attribute, value } => format!("({}~={})", attribute, value),
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut out = String::from("(");
                if let Some(attribute) = attribute {
                    out.push_str(attribute);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                out.push_str(value);
                out.push(')');
                out
            }
        }
    }
}

fn join(filters: &[Filter]) -> String {
    filters.iter().map(Filter::to_ldap_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_equality() {
        let f = Filter::equality("cn", "regular_user");
        assert_eq!(f.as_equality(), Some(("cn", "regular_user")));
        assert_eq!(Filter::Present("cn".to_string()).as_equality(), None);
    }

    #[test]
    fn test_substrings_to_ldap_string() {
        let trailing = Filter::Substrings {
            attribute: "cn".to_string(),
            initial: Some("regular_user".to_string()),
            any: vec![],
            last: None,
        };
        assert_eq!(trailing.to_ldap_string(), "(cn=regular_user*)");

        let leading = Filter::Substrings {
            attribute: "cn".to_string(),
            initial: None,
            any: vec!["mid".to_string()],
            last: Some("user".to_string()),
        };
        assert_eq!(leading.to_ldap_string(), "(cn=*mid*user)");
    }

    #[test]
    fn test_compound_to_ldap_string() {
        let f = Filter::And(vec![
            Filter::equality("objectClass", "inetOrgPerson"),
            Filter::Not(Box::new(Filter::Present("mail".to_string()))),
        ]);
        assert_eq!(f.to_ldap_string(), "(&(objectClass=inetOrgPerson)(!(mail=*)))");
        assert_eq!(f.operator(), "and");
    }

    #[test]
    fn test_extensible_to_ldap_string() {
        let f = Filter::Extensible {
            matching_rule: Some("2.5.13.5".to_string()),
            attribute: Some("cn".to_string()),
            value: "Jane".to_string(),
            dn_attributes: true,
        };
        assert_eq!(f.to_ldap_string(), "(cn:dn:2.5.13.5:=Jane)");
    }
}
