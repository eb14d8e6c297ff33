use serde::{Deserialize, Serialize};

use commitbox_core::{DomainError, DomainResult, ValueObject};

/// Identity-free profile shared by riders and operators.
///
/// `credential_hash` is stored as given; hashing happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    name: String,
    affiliation: Option<String>,
    email: Option<String>,
    username: Option<String>,
    credential_hash: Option<String>,
    /// Opaque reference (path, URL or blob key) to a profile image.
    profile_image: Option<String>,
}

impl ValueObject for AccountProfile {}

impl AccountProfile {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(Self {
            name,
            affiliation: None,
            email: None,
            username: None,
            credential_hash: None,
            profile_image: None,
        })
    }

    pub fn with_affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliation = Some(affiliation.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> DomainResult<Self> {
        let email = email.into();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
                self.email = Some(email);
                Ok(self)
            }
            _ => Err(DomainError::validation(format!("invalid email: {email}"))),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> DomainResult<Self> {
        let username = username.into();
        if username.is_empty() || username.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("username must be non-empty without spaces"));
        }
        self.username = Some(username);
        Ok(self)
    }

    pub fn with_credential_hash(mut self, hash: impl Into<String>) -> Self {
        self.credential_hash = Some(hash.into());
        self
    }

    pub fn with_profile_image(mut self, reference: impl Into<String>) -> Self {
        self.profile_image = Some(reference.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn affiliation(&self) -> Option<&str> {
        self.affiliation.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn credential_hash(&self) -> Option<&str> {
        self.credential_hash.as_deref()
    }

    pub fn profile_image(&self) -> Option<&str> {
        self.profile_image.as_deref()
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) -> DomainResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        self.name = name;
        Ok(())
    }
}
