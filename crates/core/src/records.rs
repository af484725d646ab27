//! Turning directory entries into map lines.
//!
//! Both maps start from the same [`MailRecord`] extraction so they agree on
//! what an entry's mail address is. The credential map is one line per entry
//! in result order; the alias map groups entries by each alias they list.
//!
//! Credential map line:
//!
//! ```text
//! jdoe:{SSHA}mE3b2N0zZ3pvbW9zYWx0
//! ```
//!
//! Alias map line:
//!
//! ```text
//! postmaster: jdoe@example.com,alice@example.com
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Write};

use ldap3::SearchEntry;

use crate::config::AttributeNames;

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// The values the maps need from one directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailRecord {
    pub dn: String,
    pub mail: String,
    pub credential_hash: String,
    pub aliases: Vec<String>,
}

impl MailRecord {
    /// Pull the mail, password hash and alias values out of `entry`.
    ///
    /// Never fails: a missing single-valued attribute becomes `""` and a
    /// missing alias attribute becomes an empty list.
    pub fn extract(entry: &SearchEntry, attrs: &AttributeNames) -> Self {
        Self {
            dn: entry.dn.clone(),
            mail: first_value(entry, &attrs.mail),
            credential_hash: first_value(entry, &attrs.password),
            aliases: all_values(entry, &attrs.aliases),
        }
    }
}

/// Attribute names are case-insensitive in LDAP, so servers are free to
/// return `mail` for a request of `Mail`.
fn values<'a>(entry: &'a SearchEntry, name: &str) -> Vec<Cow<'a, str>> {
    if let Some((_, vals)) = entry
        .attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
        return vals.iter().map(|v| Cow::Borrowed(v.as_str())).collect();
    }

    // Values that are not valid UTF-8 land in bin_attrs (userPassword is an
    // octet string on most servers).
    entry
        .bin_attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, vals)| vals.iter().map(|v| String::from_utf8_lossy(v)).collect())
        .unwrap_or_default()
}

fn first_value(entry: &SearchEntry, name: &str) -> String {
    values(entry, name)
        .into_iter()
        .next()
        .map(Cow::into_owned)
        .unwrap_or_default()
}

fn all_values(entry: &SearchEntry, name: &str) -> Vec<String> {
    values(entry, name).into_iter().map(Cow::into_owned).collect()
}

// ---------------------------------------------------------------------------
// Credential map
// ---------------------------------------------------------------------------

/// Local part of a mail address: everything before the first `@`, or the
/// whole value when there is none.
pub fn local_user(mail: &str) -> &str {
    mail.split_once('@').map_or(mail, |(user, _)| user)
}

/// One `user:hash` line of the credential map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord<'a> {
    pub local_user: &'a str,
    pub credential_hash: &'a str,
}

impl<'a> CredentialRecord<'a> {
    pub fn from_record(record: &'a MailRecord) -> Self {
        Self {
            local_user: local_user(&record.mail),
            credential_hash: &record.credential_hash,
        }
    }
}

/// Write one credential line per record, in the given order. Duplicate users
/// are written as they come. Returns the number of lines written.
pub fn write_credentials<W: Write>(out: &mut W, records: &[MailRecord]) -> io::Result<usize> {
    for record in records {
        let cred = CredentialRecord::from_record(record);
        writeln!(out, "{}:{}", cred.local_user, cred.credential_hash)?;
    }
    Ok(records.len())
}

// ---------------------------------------------------------------------------
// Alias map
// ---------------------------------------------------------------------------

/// Alias → mail addresses of every entry listing that alias.
///
/// Keys are kept sorted so that identical directory contents always produce
/// identical files. Targets within a key keep entry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    aliases: BTreeMap<String, Vec<String>>,
}

impl AliasTable {
    pub fn build(records: &[MailRecord]) -> Self {
        let mut aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            for alias in &record.aliases {
                aliases
                    .entry(alias.clone())
                    .or_default()
                    .push(record.mail.clone());
            }
        }
        Self { aliases }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn targets(&self, alias: &str) -> Option<&[String]> {
        self.aliases.get(alias).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.aliases
            .iter()
            .map(|(alias, targets)| (alias.as_str(), targets.as_slice()))
    }
}

/// Write one `alias: t1,t2,...` line per alias. Returns the number of lines.
pub fn write_aliases<W: Write>(out: &mut W, table: &AliasTable) -> io::Result<usize> {
    for (alias, targets) in table.iter() {
        writeln!(out, "{}: {}", alias, targets.join(","))?;
    }
    Ok(table.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: dn.into(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    fn record(mail: &str, aliases: &[&str]) -> MailRecord {
        MailRecord {
            dn: format!("uid={},dc=d", local_user(mail)),
            mail: mail.into(),
            credential_hash: "{SSHA}hash".into(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn render_aliases(records: &[MailRecord]) -> String {
        let mut out = Vec::new();
        write_aliases(&mut out, &AliasTable::build(records)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_local_user() {
        assert_eq!(local_user("a@b.com"), "a");
        assert_eq!(local_user("noat"), "noat");
        assert_eq!(local_user("a@b@c"), "a");
        assert_eq!(local_user("@b.com"), "");
        assert_eq!(local_user(""), "");
    }

    #[test]
    fn test_extract_all_attributes() {
        let e = entry(
            "uid=jdoe,dc=example,dc=com",
            &[
                ("email", &["jdoe@example.com"]),
                ("userPassword", &["{SSHA}abc"]),
                ("emailAlias", &["postmaster", "abuse"]),
            ],
        );
        let rec = MailRecord::extract(&e, &AttributeNames::default());
        assert_eq!(rec.dn, "uid=jdoe,dc=example,dc=com");
        assert_eq!(rec.mail, "jdoe@example.com");
        assert_eq!(rec.credential_hash, "{SSHA}abc");
        assert_eq!(rec.aliases, vec!["postmaster", "abuse"]);
    }

    #[test]
    fn test_extract_missing_attributes_are_empty() {
        let e = entry("uid=ghost,dc=example,dc=com", &[]);
        let rec = MailRecord::extract(&e, &AttributeNames::default());
        assert_eq!(rec.mail, "");
        assert_eq!(rec.credential_hash, "");
        assert!(rec.aliases.is_empty());
    }

    #[test]
    fn test_extract_is_case_insensitive_and_takes_first_value() {
        let e = entry(
            "uid=x,dc=d",
            &[("EMAIL", &["first@d", "second@d"]), ("userpassword", &["h"])],
        );
        let rec = MailRecord::extract(&e, &AttributeNames::default());
        assert_eq!(rec.mail, "first@d");
        assert_eq!(rec.credential_hash, "h");
    }

    #[test]
    fn test_extract_binary_password() {
        let mut e = entry("uid=x,dc=d", &[("email", &["x@d"])]);
        e.bin_attrs
            .insert("userPassword".into(), vec![b"{CRYPT}$6$salt\xff".to_vec()]);
        let rec = MailRecord::extract(&e, &AttributeNames::default());
        assert!(rec.credential_hash.starts_with("{CRYPT}$6$salt"));
    }

    #[test]
    fn test_credentials_keep_order_and_duplicates() {
        let records = vec![
            record("b@d", &[]),
            record("a@d", &[]),
            record("b@other", &[]),
            record("noat", &[]),
        ];
        let mut out = Vec::new();
        let lines = write_credentials(&mut out, &records).unwrap();
        assert_eq!(lines, 4);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "b:{SSHA}hash\na:{SSHA}hash\nb:{SSHA}hash\nnoat:{SSHA}hash\n"
        );
    }

    #[test]
    fn test_credentials_empty() {
        let mut out = Vec::new();
        assert_eq!(write_credentials(&mut out, &[]).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_alias_aggregation_keeps_entry_order() {
        let records = vec![record("x@d", &["a1"]), record("y@d", &["a1", "a2"])];
        let table = AliasTable::build(&records);
        assert_eq!(table.len(), 2);
        assert_eq!(table.targets("a1").unwrap(), ["x@d", "y@d"]);
        assert_eq!(table.targets("a2").unwrap(), ["y@d"]);
        assert_eq!(render_aliases(&records), "a1: x@d,y@d\na2: y@d\n");
    }

    #[test]
    fn test_single_target_has_no_comma() {
        let out = render_aliases(&[record("only@d", &["solo"])]);
        assert_eq!(out, "solo: only@d\n");
    }

    #[test]
    fn test_entry_without_aliases_contributes_nothing() {
        let records = vec![record("x@d", &[])];
        let table = AliasTable::build(&records);
        assert!(table.is_empty());
        assert_eq!(render_aliases(&records), "");
    }

    #[test]
    fn test_repeated_alias_on_one_entry_repeats_target() {
        let out = render_aliases(&[record("x@d", &["dup", "dup"])]);
        assert_eq!(out, "dup: x@d,x@d\n");
    }

    #[test]
    fn test_alias_lines_are_sorted_by_key() {
        let records = vec![
            record("x@d", &["zeta", "alpha"]),
            record("y@d", &["mid"]),
        ];
        assert_eq!(
            render_aliases(&records),
            "alpha: x@d\nmid: y@d\nzeta: x@d\n"
        );
    }
}
