use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use commitbox_core::{DomainResult, Entity};
use commitbox_events::Event;

use crate::profile::AccountProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Rider,
    Operator,
}

/// Entity: a rider account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rider {
    profile: AccountProfile,
}

/// Entity: an operator account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    profile: AccountProfile,
}

impl Entity for Rider {
    const TABLE: &'static str = "riders";
}

impl Entity for Operator {
    const TABLE: &'static str = "operators";
}

impl Rider {
    pub fn new(profile: AccountProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &AccountProfile {
        &self.profile
    }

    /// Event announcing this rider, stamped with `occurred_at`.
    pub fn registered(&self, occurred_at: DateTime<Utc>) -> RiderRegistered {
        RiderRegistered {
            name: self.profile.name().to_string(),
            affiliation: self.profile.affiliation().map(str::to_string),
            occurred_at,
        }
    }

    pub fn rename(&mut self, name: impl Into<String>, occurred_at: DateTime<Utc>) -> DomainResult<ProfileUpdated> {
        self.profile.rename(name)?;
        Ok(ProfileUpdated::of(AccountKind::Rider, &self.profile, occurred_at))
    }
}

impl Operator {
    pub fn new(profile: AccountProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &AccountProfile {
        &self.profile
    }

    pub fn registered(&self, occurred_at: DateTime<Utc>) -> OperatorRegistered {
        OperatorRegistered {
            name: self.profile.name().to_string(),
            affiliation: self.profile.affiliation().map(str::to_string),
            occurred_at,
        }
    }

    pub fn rename(&mut self, name: impl Into<String>, occurred_at: DateTime<Utc>) -> DomainResult<ProfileUpdated> {
        self.profile.rename(name)?;
        Ok(ProfileUpdated::of(AccountKind::Operator, &self.profile, occurred_at))
    }
}

/// Event: RiderRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiderRegistered {
    pub name: String,
    pub affiliation: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OperatorRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRegistered {
    pub name: String,
    pub affiliation: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProfileUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdated {
    pub account: AccountKind,
    pub name: String,
    pub affiliation: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ProfileUpdated {
    fn of(account: AccountKind, profile: &AccountProfile, occurred_at: DateTime<Utc>) -> Self {
        Self {
            account,
            name: profile.name().to_string(),
            affiliation: profile.affiliation().map(str::to_string),
            occurred_at,
        }
    }
}

impl Event for RiderRegistered {
    fn event_type(&self) -> &'static str {
        "RiderRegistered"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Event for OperatorRegistered {
    fn event_type(&self) -> &'static str {
        "OperatorRegistered"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Event for ProfileUpdated {
    fn event_type(&self) -> &'static str {
        "ProfileUpdated"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commitbox_core::DomainError;

    fn profile(name: &str) -> AccountProfile {
        AccountProfile::new(name).unwrap().with_affiliation("Concordia")
    }

    #[test]
    fn registration_events_carry_name_and_affiliation() {
        let at = Utc::now();
        let rider = Rider::new(profile("Bhaskar"));
        let event = rider.registered(at);
        assert_eq!(event.event_type(), "RiderRegistered");
        assert_eq!(event.name, "Bhaskar");
        assert_eq!(event.affiliation.as_deref(), Some("Concordia"));
        assert_eq!(event.occurred_at(), at);

        let operator = Operator::new(profile("BhaskarDas"));
        assert_eq!(operator.registered(at).event_type(), "OperatorRegistered");
    }

    #[test]
    fn rename_emits_profile_updated() {
        let mut operator = Operator::new(profile("BhaskarDas"));
        let event = operator.rename("B. Das", Utc::now()).unwrap();
        assert_eq!(event.account, AccountKind::Operator);
        assert_eq!(event.name, "B. Das");
        assert_eq!(operator.profile().name(), "B. Das");
    }

    #[test]
    fn rename_to_blank_is_rejected_and_keeps_name() {
        let mut rider = Rider::new(profile("Bhaskar"));
        let err = rider.rename(" ", Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(rider.profile().name(), "Bhaskar");
    }

    #[test]
    fn entities_write_to_their_own_tables() {
        assert_eq!(Rider::TABLE, "riders");
        assert_eq!(Operator::TABLE, "operators");
    }

    #[test]
    fn rider_body_is_plain_json() {
        let rider = Rider::new(profile("Bhaskar"));
        let json = serde_json::to_value(&rider).unwrap();
        assert_eq!(json["profile"]["name"], "Bhaskar");
        assert_eq!(json["profile"]["affiliation"], "Concordia");
    }
}
