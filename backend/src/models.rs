use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::Row;
use thiserror::Error;

use crate::error::{AppError, AppResult};

/// Input shapes implement this so extractors can reject them with a 400 before a
/// session is opened.
pub trait Validate {
    fn validate(&self) -> AppResult<()>;
}

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStatus {
    Pending,
    Approved,
    Rejected,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "PENDING",
            AuthorizationStatus::Approved => "APPROVED",
            AuthorizationStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

/// Accepts exactly the serialized form, as the JSON and query decoders do.
impl FromStr for AuthorizationStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(AuthorizationStatus::Pending),
            "APPROVED" => Ok(AuthorizationStatus::Approved),
            "REJECTED" => Ok(AuthorizationStatus::Rejected),
            _ => Err(UnknownVariant {
                kind: "authorization status",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Disputed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "OPEN",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Disputed => "DISPUTED",
        }
    }

    /// PAID is terminal; OPEN and DISPUTED can move to any other status.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        match (self, next) {
            (InvoiceStatus::Paid, _) => false,
            (current, next) => *current != next,
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "OPEN" => Ok(InvoiceStatus::Open),
            "PAID" => Ok(InvoiceStatus::Paid),
            "DISPUTED" => Ok(InvoiceStatus::Disputed),
            _ => Err(UnknownVariant {
                kind: "invoice status",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    Patient,
    Provider,
}

/// Timestamps are persisted as fixed-width RFC 3339 text so both stores sort and
/// compare them the same way.
pub fn timestamp_text(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(decode_error)
}

fn decode_error<E>(error: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(error))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub member_number: String,
    pub insured: bool,
}

impl Patient {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let birth_date: String = row.try_get("birth_date")?;
        Ok(Self {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            birth_date: NaiveDate::parse_from_str(&birth_date, "%Y-%m-%d")
                .map_err(decode_error)?,
            member_number: row.try_get("member_number")?,
            insured: row.try_get("insured")?,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub specialty: Option<String>,
}

impl Provider {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            specialty: row.try_get("specialty")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Treatment {
    pub id: i64,
    pub code: String,
    pub description: String,
    pub cost: f64,
}

impl Treatment {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            cost: row.try_get("cost")?,
        })
    }
}

/// A clinic's request for the insurer to cover a treatment for a patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub id: i64,
    pub patient_id: i64,
    pub provider_id: i64,
    pub treatment_id: i64,
    pub justification: Option<String>,
    pub status: AuthorizationStatus,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_notes: Option<String>,
}

impl AuthorizationRequest {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let requested_at: String = row.try_get("requested_at")?;
        let decided_at: Option<String> = row.try_get("decided_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            patient_id: row.try_get("patient_id")?,
            provider_id: row.try_get("provider_id")?,
            treatment_id: row.try_get("treatment_id")?,
            justification: row.try_get("justification")?,
            status: status.parse().map_err(decode_error)?,
            requested_at: parse_timestamp(&requested_at)?,
            decided_at: decided_at.as_deref().map(parse_timestamp).transpose()?,
            decision_notes: row.try_get("decision_notes")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: i64,
    pub authorization_id: i64,
    pub amount: f64,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    /// Itemized concepts. Loaded separately from the invoice row.
    #[serde(default)]
    pub lines: Vec<InvoiceLine>,
}

impl Invoice {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let issued_at: String = row.try_get("issued_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            authorization_id: row.try_get("authorization_id")?,
            amount: row.try_get("amount")?,
            status: status.parse().map_err(decode_error)?,
            issued_at: parse_timestamp(&issued_at)?,
            lines: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub id: i64,
    pub invoice_id: i64,
    pub concept: String,
    pub amount: f64,
}

impl InvoiceLine {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            invoice_id: row.try_get("invoice_id")?,
            concept: row.try_get("concept")?,
            amount: row.try_get("amount")?,
        })
    }
}

/// A service the clinic offers, and whether the mutual insurance covers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicService {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub service_type: String,
    pub price: f64,
    pub covered: bool,
    pub duration_minutes: i64,
}

impl ClinicService {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            service_type: row.try_get("service_type")?,
            price: row.try_get("price")?,
            covered: row.try_get("covered")?,
            duration_minutes: row.try_get("duration_minutes")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationTally {
    pub total: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
}

impl AuthorizationTally {
    pub fn record(&mut self, status: AuthorizationStatus) {
        self.total += 1;
        match status {
            AuthorizationStatus::Pending => self.pending += 1,
            AuthorizationStatus::Approved => self.approved += 1,
            AuthorizationStatus::Rejected => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceTally {
    pub count: i64,
    pub total_amount: f64,
    pub open_amount: f64,
    pub paid_amount: f64,
    pub disputed_amount: f64,
}

impl InvoiceTally {
    pub fn record(&mut self, status: InvoiceStatus, amount: f64) {
        self.count += 1;
        self.total_amount += amount;
        match status {
            InvoiceStatus::Open => self.open_amount += amount,
            InvoiceStatus::Paid => self.paid_amount += amount,
            InvoiceStatus::Disputed => self.disputed_amount += amount,
        }
    }
}

/// Computed on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub subject_id: i64,
    pub subject_type: SubjectType,
    pub subject_name: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub authorizations: AuthorizationTally,
    pub invoices: InvoiceTally,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub member_number: String,
    #[serde(default)]
    pub insured: Option<bool>,
}

impl Validate for NewPatient {
    fn validate(&self) -> AppResult<()> {
        require_text("firstName", &self.first_name)?;
        require_text("lastName", &self.last_name)?;
        require_text("memberNumber", &self.member_number)?;
        if self.birth_date > Utc::now().date_naive() {
            return Err(AppError::invalid("birthDate", "must not be in the future"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProvider {
    pub name: String,
    #[serde(default)]
    pub specialty: Option<String>,
}

impl Validate for NewProvider {
    fn validate(&self) -> AppResult<()> {
        require_text("name", &self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTreatment {
    pub code: String,
    pub description: String,
    pub cost: f64,
}

impl Validate for NewTreatment {
    fn validate(&self) -> AppResult<()> {
        require_text("code", &self.code)?;
        require_text("description", &self.description)?;
        require_positive_amount("cost", self.cost)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAuthorization {
    pub patient_id: i64,
    pub provider_id: i64,
    pub treatment_id: i64,
    #[serde(default)]
    pub justification: Option<String>,
}

const MAX_NOTE_LEN: usize = 2000;

impl Validate for NewAuthorization {
    fn validate(&self) -> AppResult<()> {
        require_id("patientId", self.patient_id)?;
        require_id("providerId", self.provider_id)?;
        require_id("treatmentId", self.treatment_id)?;
        limit_note("justification", self.justification.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub decision: AuthorizationStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Validate for DecisionRequest {
    fn validate(&self) -> AppResult<()> {
        if !self.decision.is_decided() {
            return Err(AppError::invalid(
                "decision",
                "must be APPROVED or REJECTED",
            ));
        }
        limit_note("notes", self.notes.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoiceLine {
    pub concept: String,
    pub amount: f64,
}

/// Line amounts may be omitted; when present they must add up to the invoice total.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoice {
    pub authorization_id: i64,
    pub amount: f64,
    #[serde(default)]
    pub lines: Vec<NewInvoiceLine>,
}

const AMOUNT_TOLERANCE: f64 = 0.005;

impl Validate for NewInvoice {
    fn validate(&self) -> AppResult<()> {
        require_id("authorizationId", self.authorization_id)?;
        require_positive_amount("amount", self.amount)?;
        for line in &self.lines {
            require_text("lines.concept", &line.concept)?;
            require_positive_amount("lines.amount", line.amount)?;
        }
        if !self.lines.is_empty() {
            let total: f64 = self.lines.iter().map(|line| line.amount).sum();
            if (total - self.amount).abs() > AMOUNT_TOLERANCE {
                return Err(AppError::invalid(
                    "lines",
                    format!("line amounts add up to {total:.2}, not {:.2}", self.amount),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClinicService {
    pub name: String,
    pub description: String,
    pub service_type: String,
    pub price: f64,
    #[serde(default)]
    pub covered: bool,
    pub duration_minutes: i64,
}

impl Validate for NewClinicService {
    fn validate(&self) -> AppResult<()> {
        require_text("name", &self.name)?;
        require_text("serviceType", &self.service_type)?;
        require_positive_amount("price", self.price)?;
        if self.duration_minutes <= 0 {
            return Err(AppError::invalid("durationMinutes", "must be positive"));
        }
        Ok(())
    }
}

/// `covered=true` narrows the listing to services the insurance includes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicServiceQuery {
    pub covered: Option<bool>,
}

impl Validate for ClinicServiceQuery {
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatusUpdate {
    pub status: InvoiceStatus,
}

impl Validate for InvoiceStatusUpdate {
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Filter for the authorization listing. Every field is optional; an empty filter
/// matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationFilter {
    pub patient_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub status: Option<AuthorizationStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuthorizationFilter {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

impl Validate for AuthorizationFilter {
    fn validate(&self) -> AppResult<()> {
        if let Some(offset) = self.offset {
            if offset < 0 {
                return Err(AppError::invalid("offset", "must not be negative"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceQuery {
    pub patient_id: i64,
}

impl Validate for InvoiceQuery {
    fn validate(&self) -> AppResult<()> {
        require_id("patientId", self.patient_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQuery {
    pub subject_id: i64,
    pub subject_type: SubjectType,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Validate for ReportQuery {
    fn validate(&self) -> AppResult<()> {
        require_id("subjectId", self.subject_id)?;
        if self.from > self.to {
            return Err(AppError::invalid("from", "must not be after `to`"));
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_id(field: &str, value: i64) -> AppResult<()> {
    if value <= 0 {
        return Err(AppError::invalid(field, "must be a positive id"));
    }
    Ok(())
}

fn require_positive_amount(field: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::invalid(field, "must be a positive amount"));
    }
    Ok(())
}

fn limit_note(field: &str, value: Option<&str>) -> AppResult<()> {
    match value {
        Some(text) if text.chars().count() > MAX_NOTE_LEN => Err(AppError::invalid(
            field,
            format!("must be at most {MAX_NOTE_LEN} characters"),
        )),
        _ => Ok(()),
    }
}
