use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A dated entry in a patient's medical history (visit, lab result, prescription).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MedicalRecord {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub doctor_id: Option<Uuid>,
}

impl MedicalRecord {
    pub fn new(title: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            date,
            title: title.into(),
            description: None,
            doctor_id: None,
        }
    }
}

/// A household member whose health data is kept in the encrypted store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub blood_type: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub records: Vec<MedicalRecord>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            date_of_birth: None,
            blood_type: None,
            allergies: Vec::new(),
            conditions: Vec::new(),
            medications: Vec::new(),
            records: Vec::new(),
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Drop medical records dated before `cutoff`. Returns how many were removed.
    pub fn retain_records_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|record| record.date >= cutoff);
        before - self.records.len()
    }
}

/// A care provider referenced by patients' records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Doctor {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Doctor {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            specialty: None,
            phone: None,
            email: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Age threshold beyond which medical records are left out of loaded results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionHorizon {
    pub days: u32,
}

impl RetentionHorizon {
    pub fn days(days: u32) -> Self {
        Self { days }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.days))
    }

    /// Apply the horizon to every patient, returning the number of records dropped.
    pub fn apply(&self, patients: &mut [Patient], now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        patients
            .iter_mut()
            .map(|patient| patient.retain_records_since(cutoff))
            .sum()
    }

    /// Carry over records from `stored` that a filtered read would not have
    /// shown, so writing back a loaded patient never loses them.
    pub fn restore_hidden(&self, patient: &mut Patient, stored: &Patient, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let hidden: Vec<MedicalRecord> = stored
            .records
            .iter()
            .filter(|record| record.date < cutoff)
            .filter(|record| patient.records.iter().all(|kept| kept.id != record.id))
            .cloned()
            .collect();
        let restored = hidden.len();
        if restored > 0 {
            patient.records.extend(hidden);
            patient.records.sort_by_key(|record| record.date);
        }
        restored
    }
}
