//! Directory access.
//!
//! The export pipeline only ever needs one thing from the directory: a
//! whole-subtree search returning entries in server order. That capability is
//! the [`DirectorySource`] trait; [`LdapDirectory`] implements it over a real
//! LDAP connection and tests substitute an in-memory source.

pub mod ldap;
pub mod tls;

pub use ldap::LdapDirectory;
pub use ldap3::SearchEntry;

use crate::config::DirectoryConfig;
use crate::errors::DirectoryError;

/// A whole-subtree search below `base_dn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub filter: String,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            base_dn: config.base_dn.clone(),
            filter: config.filter.clone(),
            attributes: config.search_attributes(),
        }
    }
}

/// Something that can answer a subtree search.
pub trait DirectorySource {
    /// Run the search and return all entries in result order.
    fn search(&mut self, request: &SearchRequest) -> Result<Vec<SearchEntry>, DirectoryError>;
}
