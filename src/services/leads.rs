use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::lead::{self, Entity as Lead, LeadStatus, Model as LeadModel},
    errors::ServiceError,
    services::checkout::session::ContactInfo,
};

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub struct LeadService {
    db: Arc<DatabaseConnection>,
}

impl LeadService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts or refreshes the lead for this email in one statement.
    /// A repeat submission updates contact fields and `updated_at`; it never
    /// creates a second row and never rewinds the lead's status.
    #[instrument(skip(self, contact, metadata), fields(email = %normalize_email(&contact.email)))]
    pub async fn capture_lead(
        &self,
        contact: &ContactInfo,
        metadata: Option<JsonValue>,
    ) -> Result<LeadModel, ServiceError> {
        let email = normalize_email(&contact.email);
        let now = Utc::now();

        let mut update_columns = vec![
            lead::Column::FullName,
            lead::Column::Phone,
            lead::Column::Country,
            lead::Column::UpdatedAt,
        ];
        if metadata.is_some() {
            update_columns.push(lead::Column::Metadata);
        }

        let row = lead::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.clone()),
            full_name: Set(contact.full_name.trim().to_string()),
            phone: Set(contact.phone.trim().to_string()),
            country: Set(contact.country.trim().to_string()),
            status: Set(LeadStatus::Contacted),
            metadata: Set(metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Lead::insert(row)
            .on_conflict(
                OnConflict::column(lead::Column::Email)
                    .update_columns(update_columns)
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        self.find_by_email(&email).await?.ok_or_else(|| {
            ServiceError::InternalError(format!("lead {} missing after upsert", email))
        })
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<LeadModel>, ServiceError> {
        let lead = Lead::find()
            .filter(lead::Column::Email.eq(normalize_email(email)))
            .one(&*self.db)
            .await?;
        Ok(lead)
    }

    /// The stored lead for `email` if it was updated within `window` of now.
    /// Only the stored timestamp is consulted.
    pub async fn find_recent_lead(
        &self,
        email: &str,
        window: Duration,
    ) -> Result<Option<LeadModel>, ServiceError> {
        self.find_recent_lead_at(email, window, Utc::now()).await
    }

    pub async fn find_recent_lead_at(
        &self,
        email: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LeadModel>, ServiceError> {
        let lead = self.find_by_email(email).await?;
        Ok(lead.filter(|lead| now - lead.updated_at <= window))
    }

    pub async fn is_recent_lead(&self, email: &str, window: Duration) -> Result<bool, ServiceError> {
        Ok(self.find_recent_lead(email, window).await?.is_some())
    }

    /// Best-effort progress marker. Failures are logged and swallowed.
    pub async fn update_lead_status(&self, email: &str, status: LeadStatus) {
        let email = normalize_email(email);
        let result = Lead::update_many()
            .set(lead::ActiveModel {
                status: Set(status),
                ..Default::default()
            })
            .filter(lead::Column::Email.eq(email.clone()))
            .exec(&*self.db)
            .await;

        match result {
            Ok(res) if res.rows_affected == 0 => {
                debug!(%email, ?status, "no lead to update");
            }
            Ok(_) => {
                debug!(%email, ?status, "lead status updated");
            }
            Err(e) => {
                warn!(%email, ?status, error = %e, "failed to update lead status");
            }
        }
    }
}
