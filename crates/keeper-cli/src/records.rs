use chrono::{NaiveDate, NaiveTime, Utc};
use color_eyre::{eyre::eyre, Result};
use keeper_core::records::{Doctor, MedicalRecord, Patient};
use keeper_sync::OperationType;

use crate::{
    app::App,
    cli::{DoctorCommand, PatientCommand},
};

/// Execute a patient subcommand against the unlocked store.
pub async fn handle_patient(cmd: PatientCommand, app: &App) -> Result<()> {
    match cmd {
        PatientCommand::List => {
            let patients = app.store.load_patients().await?;
            if patients.is_empty() {
                println!("No patients yet. Add one with `keeper patient add <name>`.");
                return Ok(());
            }
            for patient in patients {
                println!("{} {}", patient.id, patient.name);
                if let Some(dob) = patient.date_of_birth {
                    println!("    born: {dob}");
                }
                if !patient.allergies.is_empty() {
                    println!("    allergies: {}", patient.allergies.join(", "));
                }
                for record in &patient.records {
                    println!("    {} {}", record.date.date_naive(), record.title);
                }
            }
        }
        PatientCommand::Add {
            name,
            dob,
            blood_type,
            allergies,
        } => {
            let mut patient = Patient::new(name);
            patient.date_of_birth = dob;
            patient.blood_type = blood_type;
            patient.allergies = allergies;
            let patient = app.store.add_patient(patient).await?;
            app.record_change(OperationType::Create, "patient", patient.id)
                .await?;
            println!("Added patient {}: {}", patient.id, patient.name);
        }
        PatientCommand::Remove { id } => {
            app.store.delete_patient(id).await?;
            app.record_change(OperationType::Delete, "patient", id).await?;
            println!("Removed patient {id}");
        }
        PatientCommand::Record {
            patient,
            title,
            date,
            description,
            doctor,
        } => {
            let mut target = app
                .store
                .load_patients()
                .await?
                .into_iter()
                .find(|p| p.id == patient)
                .ok_or_else(|| eyre!("no patient with id {patient}"))?;

            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let mut record = MedicalRecord::new(title, at_noon(date));
            record.description = description;
            record.doctor_id = doctor;
            target.records.push(record);

            let updated = app.store.update_patient(target).await?;
            app.record_change(OperationType::Update, "patient", updated.id)
                .await?;
            println!("Recorded visit for {}", updated.name);
            if app.config.security.retention_days > 0
                && (Utc::now().date_naive() - date).num_days()
                    > i64::from(app.config.security.retention_days)
            {
                println!(
                    "Note: records older than {} days are not shown.",
                    app.config.security.retention_days
                );
            }
        }
    }
    Ok(())
}

/// Execute a doctor subcommand against the unlocked store.
pub async fn handle_doctor(cmd: DoctorCommand, app: &App) -> Result<()> {
    match cmd {
        DoctorCommand::List => {
            let doctors = app.store.load_doctors().await?;
            if doctors.is_empty() {
                println!("No doctors yet. Add one with `keeper doctor add <name>`.");
                return Ok(());
            }
            for doctor in doctors {
                match doctor.specialty {
                    Some(specialty) => println!("{} {} ({specialty})", doctor.id, doctor.name),
                    None => println!("{} {}", doctor.id, doctor.name),
                }
            }
        }
        DoctorCommand::Add {
            name,
            specialty,
            phone,
            email,
        } => {
            let mut doctor = Doctor::new(name);
            doctor.specialty = specialty;
            doctor.phone = phone;
            doctor.email = email;
            let doctor = app.store.add_doctor(doctor).await?;
            app.record_change(OperationType::Create, "doctor", doctor.id)
                .await?;
            println!("Added doctor {}: {}", doctor.id, doctor.name);
        }
        DoctorCommand::Remove { id } => {
            app.store.delete_doctor(id).await?;
            app.record_change(OperationType::Delete, "doctor", id).await?;
            println!("Removed doctor {id}");
        }
    }
    Ok(())
}

fn at_noon(date: NaiveDate) -> chrono::DateTime<Utc> {
    date.and_time(NaiveTime::MIN + chrono::Duration::hours(12))
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_app;

    #[tokio::test]
    async fn patient_lifecycle_through_handlers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path()).await;
        app.unlock(Some("pw")).await.unwrap();

        handle_patient(
            PatientCommand::Add {
                name: "Ada".into(),
                dob: None,
                blood_type: Some("O+".into()),
                allergies: vec!["latex".into()],
            },
            &app,
        )
        .await
        .expect("add");
        let id = app.store.load_patients().await.unwrap()[0].id;

        handle_patient(
            PatientCommand::Record {
                patient: id,
                title: "checkup".into(),
                date: None,
                description: None,
                doctor: None,
            },
            &app,
        )
        .await
        .expect("record");
        assert_eq!(app.store.load_patients().await.unwrap()[0].records.len(), 1);

        handle_patient(PatientCommand::Remove { id }, &app)
            .await
            .expect("remove");
        assert!(app.store.load_patients().await.unwrap().is_empty());

        let queued: Vec<_> = app
            .queue
            .pending_operations()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.op_type)
            .collect();
        assert_eq!(
            queued,
            vec![
                OperationType::Create,
                OperationType::Update,
                OperationType::Delete
            ]
        );
    }

    #[tokio::test]
    async fn record_for_unknown_patient_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path()).await;
        app.unlock(Some("pw")).await.unwrap();
        let result = handle_patient(
            PatientCommand::Record {
                patient: uuid::Uuid::new_v4(),
                title: "x".into(),
                date: None,
                description: None,
                doctor: None,
            },
            &app,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn doctor_handlers_require_unlock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path()).await;
        assert!(handle_doctor(DoctorCommand::List, &app).await.is_err());

        app.unlock(Some("pw")).await.unwrap();
        handle_doctor(
            DoctorCommand::Add {
                name: "Dr. Quinn".into(),
                specialty: Some("GP".into()),
                phone: None,
                email: None,
            },
            &app,
        )
        .await
        .expect("add");
        assert_eq!(app.store.load_doctors().await.unwrap()[0].specialty.as_deref(), Some("GP"));
    }

    #[test]
    fn records_are_dated_at_noon_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(at_noon(date).to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }
}
