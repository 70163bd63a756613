//! Calendar bookings recorded through the approval API.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Booking, CalendarService};
use crate::error::ExternalError;
use crate::store::Database;

/// [`CalendarService`] that reads bookings the operator recorded via
/// `POST /api/leads/{id}/booking`.
pub struct BookingLedger {
    db: Arc<dyn Database>,
}

impl BookingLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CalendarService for BookingLedger {
    async fn confirm_booking(&self, lead_id: Uuid) -> Result<Option<Booking>, ExternalError> {
        self.db
            .booking_for(lead_id)
            .await
            .map_err(|e| ExternalError::InvalidResponse {
                service: "calendar".into(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::LeadProfile;
    use crate::store::LibSqlBackend;
    use chrono::Utc;

    #[tokio::test]
    async fn confirms_recorded_booking() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db
            .upsert_lead(&LeadProfile::new("https://linkedin.com/in/x", "X"), Utc::now())
            .await
            .unwrap();
        let ledger = BookingLedger::new(Arc::clone(&db));

        assert!(ledger.confirm_booking(lead.id).await.unwrap().is_none());

        db.record_booking(&Booking {
            lead_id: lead.id,
            scheduled_for: Utc::now(),
            note: None,
        })
        .await
        .unwrap();
        assert!(ledger.confirm_booking(lead.id).await.unwrap().is_some());
    }
}
