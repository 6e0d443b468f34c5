//! Duplicate-request driver.
//!
//! Fires every registration request several times at once and tallies the
//! outcomes per openid. A correct coordinator yields exactly one
//! `Registered` per openid no matter how many duplicates race.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, RegistrationOutcome};
use crate::identity::RegistrationRequest;

/// Default number of copies of each request.
pub const DEFAULT_DUPLICATES: usize = 3;

/// Anything that can carry out a registration attempt.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> anyhow::Result<RegistrationOutcome>;
}

#[async_trait]
impl Registrar for Coordinator {
    async fn register(&self, request: &RegistrationRequest) -> anyhow::Result<RegistrationOutcome> {
        Ok(Coordinator::register(self, request).await?)
    }
}

/// `count` requests with fresh random openids.
#[must_use]
pub fn mock_users(count: usize) -> Vec<RegistrationRequest> {
    (1..=count)
        .map(|index| {
            RegistrationRequest::new(
                Uuid::new_v4().to_string(),
                format!("mock_name_{index}"),
                format!("mock_pwd_{index}"),
            )
        })
        .collect()
}

/// Outcome counts for one openid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdentityTally {
    pub registered: usize,
    pub already_registered: usize,
    pub unavailable: usize,
    pub failed: usize,
}

impl IdentityTally {
    fn record(&mut self, result: &anyhow::Result<RegistrationOutcome>) {
        match result {
            Ok(RegistrationOutcome::Registered { .. }) => self.registered += 1,
            Ok(RegistrationOutcome::AlreadyRegistered) => self.already_registered += 1,
            Ok(RegistrationOutcome::Unavailable) => self.unavailable += 1,
            Err(_) => self.failed += 1,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.registered + self.already_registered + self.unavailable + self.failed
    }
}

/// Result of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub duplicates: usize,
    pub identities: BTreeMap<String, IdentityTally>,
}

impl BatchReport {
    /// Openids that were registered more than once.
    #[must_use]
    pub fn violations(&self) -> Vec<&str> {
        self.identities
            .iter()
            .filter(|(_, tally)| tally.registered > 1)
            .map(|(openid, _)| openid.as_str())
            .collect()
    }

    /// Totals across all openids.
    #[must_use]
    pub fn totals(&self) -> IdentityTally {
        self.identities
            .values()
            .fold(IdentityTally::default(), |acc, t| IdentityTally {
                registered: acc.registered + t.registered,
                already_registered: acc.already_registered + t.already_registered,
                unavailable: acc.unavailable + t.unavailable,
                failed: acc.failed + t.failed,
            })
    }

    #[must_use]
    pub fn is_at_most_once(&self) -> bool {
        self.violations().is_empty()
    }
}

/// Send each request `duplicates` times, all concurrently.
pub async fn run_batch<R>(
    registrar: Arc<R>,
    users: Vec<RegistrationRequest>,
    duplicates: usize,
) -> BatchReport
where
    R: Registrar + ?Sized,
{
    let attempts = users.iter().flat_map(|user| {
        let registrar = Arc::clone(&registrar);
        (0..duplicates).map(move |_| {
            let registrar = Arc::clone(&registrar);
            let user = user.clone();
            async move {
                let result = registrar.register(&user).await;
                (user.openid, result)
            }
        })
    });
    let results = join_all(attempts).await;

    let mut report = BatchReport {
        duplicates,
        identities: BTreeMap::new(),
    };
    for user in &users {
        report.identities.entry(user.openid.clone()).or_default();
    }
    for (openid, result) in results {
        if let Err(e) = &result {
            warn!(openid = %openid, error = %e, "Registration attempt failed");
        }
        report.identities.entry(openid).or_default().record(&result);
    }

    let totals = report.totals();
    info!(
        identities = report.identities.len(),
        duplicates,
        registered = totals.registered,
        already_registered = totals.already_registered,
        unavailable = totals.unavailable,
        failed = totals.failed,
        "Batch registration finished"
    );
    report
}
