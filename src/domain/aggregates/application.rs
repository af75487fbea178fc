//! Affiliate application
//!
//! Applicants ask to join the program with a desired code; an admin approves
//! (which enrolls an affiliate) or rejects. Applications are kept after review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::ReferralCode;
use crate::{IncentiveError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus { #[default] Pending, Approved, Rejected }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateApplication {
    id: String,
    name: String,
    email: String,
    requested_code: ReferralCode,
    status: ApplicationStatus,
    affiliate_id: Option<String>,
    submitted_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

/// Stored columns of an application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub requested_code: ReferralCode,
    pub status: ApplicationStatus,
    pub affiliate_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl From<ApplicationRecord> for AffiliateApplication {
    fn from(r: ApplicationRecord) -> Self {
        Self {
            id: r.id, name: r.name, email: r.email, requested_code: r.requested_code, status: r.status,
            affiliate_id: r.affiliate_id, submitted_at: r.submitted_at, reviewed_at: r.reviewed_at,
        }
    }
}

impl AffiliateApplication {
    pub fn submit(name: impl Into<String>, email: impl Into<String>, requested_code: ReferralCode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(), name: name.into(), email: email.into(), requested_code,
            status: ApplicationStatus::Pending, affiliate_id: None, submitted_at: Utc::now(), reviewed_at: None,
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn email(&self) -> &str { &self.email }
    pub fn requested_code(&self) -> &ReferralCode { &self.requested_code }
    pub fn status(&self) -> ApplicationStatus { self.status }
    pub fn affiliate_id(&self) -> Option<&str> { self.affiliate_id.as_deref() }
    pub fn submitted_at(&self) -> DateTime<Utc> { self.submitted_at }
    pub fn reviewed_at(&self) -> Option<DateTime<Utc>> { self.reviewed_at }

    pub(crate) fn ensure_pending(&self) -> Result<()> {
        if self.status != ApplicationStatus::Pending {
            return Err(IncentiveError::ApplicationAlreadyReviewed(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn approve(&mut self, affiliate_id: &str) -> Result<()> {
        self.ensure_pending()?;
        self.status = ApplicationStatus::Approved;
        self.affiliate_id = Some(affiliate_id.to_string());
        self.reviewed_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn reject(&mut self) -> Result<()> {
        self.ensure_pending()?;
        self.status = ApplicationStatus::Rejected;
        self.reviewed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_once() {
        let mut app = AffiliateApplication::submit("Anna", "anna@example.com", ReferralCode::new("anna").unwrap());
        app.approve("A1").unwrap();
        assert_eq!(app.status(), ApplicationStatus::Approved);
        assert_eq!(app.affiliate_id(), Some("A1"));
        assert!(app.reject().is_err());
    }
}
