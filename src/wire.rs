//! Newline-delimited JSON protocol. One request object per line, one
//! response object per line, answered in order.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterPatient {
        id: Option<Ulid>,
        name: String,
        email: String,
    },
    RegisterDoctor {
        id: Option<Ulid>,
        name: String,
        department: Option<String>,
    },
    PublishSlot {
        id: Option<Ulid>,
        doctor_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    },
    SetSlotStatus {
        id: Ulid,
        status: SlotStatus,
    },
    GetPatient {
        id: Ulid,
    },
    GetDoctor {
        id: Ulid,
    },
    GetSlot {
        id: Ulid,
    },
    ListPatients,
    ListDoctors,
    ListSlots {
        doctor_id: Ulid,
    },
    CreateAppointment {
        id: Option<Ulid>,
        patient_id: Option<Ulid>,
        doctor_id: Ulid,
        schedule_id: Ulid,
        start: Timestamp,
        end: Timestamp,
        notes: Option<String>,
        fee: Option<Fee>,
    },
    BookAppointment {
        id: Ulid,
        patient_id: Ulid,
        notes: Option<String>,
    },
    UpdateAppointment {
        id: Ulid,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        status: Option<AppointmentStatus>,
        #[serde(default, deserialize_with = "double_option")]
        notes: Option<Option<String>>,
        #[serde(default, deserialize_with = "double_option")]
        fee: Option<Option<Fee>>,
    },
    CancelAppointment {
        id: Ulid,
    },
    DeleteAppointment {
        id: Ulid,
    },
    GetAppointment {
        id: Ulid,
    },
    ListAppointments,
    AppointmentsForDoctor {
        doctor_id: Ulid,
    },
    AppointmentsForPatient {
        patient_id: Ulid,
    },
    AvailableForDoctor {
        doctor_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Why a request produced no data.
enum Failure {
    Engine(EngineError),
    Encode(serde_json::Error),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Encode(e)
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "I/O error: {e}"),
            ProtocolError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Encode(e)
    }
}

impl From<LinesCodecError> for ProtocolError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => ProtocolError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            )),
        }
    }
}

fn json<T: Serialize>(value: T) -> Result<serde_json::Value, Failure> {
    Ok(serde_json::to_value(value)?)
}

async fn execute(engine: &Engine, req: Request) -> Result<serde_json::Value, Failure> {
    match req {
        Request::RegisterPatient { id, name, email } => json(
            engine
                .register_patient(id.unwrap_or_else(Ulid::new), name, email)
                .await?,
        ),
        Request::RegisterDoctor {
            id,
            name,
            department,
        } => json(
            engine
                .register_doctor(id.unwrap_or_else(Ulid::new), name, department)
                .await?,
        ),
        Request::PublishSlot {
            id,
            doctor_id,
            date,
            start_time,
            end_time,
        } => json(
            engine
                .publish_slot(
                    id.unwrap_or_else(Ulid::new),
                    doctor_id,
                    date,
                    start_time,
                    end_time,
                )
                .await?,
        ),
        Request::SetSlotStatus { id, status } => json(engine.set_slot_status(id, status).await?),
        Request::GetPatient { id } => json(engine.find_patient(&id)?),
        Request::GetDoctor { id } => json(engine.find_doctor(&id)?),
        Request::GetSlot { id } => json(engine.find_schedule_slot(&id).await?),
        Request::ListPatients => json(engine.list_patients()),
        Request::ListDoctors => json(engine.list_doctors()),
        Request::ListSlots { doctor_id } => json(engine.list_slots(&doctor_id).await?),
        Request::CreateAppointment {
            id,
            patient_id,
            doctor_id,
            schedule_id,
            start,
            end,
            notes,
            fee,
        } => json(
            engine
                .create_appointment(NewAppointment {
                    id: id.unwrap_or_else(Ulid::new),
                    patient_id,
                    doctor_id,
                    schedule_id,
                    start,
                    end,
                    notes,
                    fee,
                })
                .await?,
        ),
        Request::BookAppointment {
            id,
            patient_id,
            notes,
        } => json(engine.book_appointment(id, patient_id, notes).await?),
        Request::UpdateAppointment {
            id,
            start,
            end,
            status,
            notes,
            fee,
        } => {
            let patch = AppointmentPatch {
                start,
                end,
                status,
                notes,
                fee,
            };
            json(engine.update_appointment(id, patch).await?)
        }
        Request::CancelAppointment { id } => json(engine.cancel_appointment(id).await?),
        Request::DeleteAppointment { id } => {
            engine.delete_appointment(id).await?;
            json(serde_json::json!({ "deleted": id }))
        }
        Request::GetAppointment { id } => json(engine.get_appointment(&id).await?),
        Request::ListAppointments => json(engine.list_appointments().await),
        Request::AppointmentsForDoctor { doctor_id } => {
            json(engine.appointments_for_doctor(&doctor_id).await)
        }
        Request::AppointmentsForPatient { patient_id } => {
            json(engine.appointments_for_patient(&patient_id).await)
        }
        Request::AvailableForDoctor { doctor_id } => {
            json(engine.available_for_doctor(&doctor_id).await)
        }
    }
}

/// Parse, execute and answer a single request line.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::OPERATIONS_TOTAL, "op" => "unknown", "status" => "bad_request")
                .increment(1);
            return Response::failure("bad_request", e.to_string());
        }
    };

    let op = observability::request_label(&req);
    let started = Instant::now();
    let response = match execute(engine, req).await {
        Ok(data) => Response::success(data),
        Err(Failure::Engine(e)) => {
            tracing::debug!(op, "request failed: {e}");
            Response::failure(e.kind(), e.to_string())
        }
        Err(Failure::Encode(e)) => {
            tracing::error!(op, "response encoding failed: {e}");
            Response::failure("internal", e.to_string())
        }
    };

    let status = match &response.error {
        None => "ok",
        Some(_) => "error",
    };
    metrics::counter!(observability::OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    response
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let response = Response::failure("limit_exceeded", "request line too long");
                framed.send(serde_json::to_string(&response)?).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&engine, &line).await;
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("medislot_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Engine {
        Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), EngineOptions::default())
            .unwrap()
    }

    #[test]
    fn parse_create_request() {
        let line = r#"{"op":"create_appointment","doctor_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "schedule_id":"01ARZ3NDEKTSV4RRFFQ69G5FAW","start":"2024-12-25T09:00:00",
            "end":"2024-12-25T10:00:00","fee":"100.00"}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        match req {
            Request::CreateAppointment {
                id,
                patient_id,
                fee,
                notes,
                ..
            } => {
                assert!(id.is_none());
                assert!(patient_id.is_none());
                assert!(notes.is_none());
                assert_eq!(fee, Some(Fee::from_cents(10_000)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn update_distinguishes_null_from_absent() {
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let absent: Request =
            serde_json::from_str(&format!(r#"{{"op":"update_appointment","id":"{id}"}}"#)).unwrap();
        let cleared: Request = serde_json::from_str(&format!(
            r#"{{"op":"update_appointment","id":"{id}","notes":null,"fee":"12.50"}}"#
        ))
        .unwrap();

        match absent {
            Request::UpdateAppointment { notes, fee, .. } => {
                assert_eq!(notes, None);
                assert_eq!(fee, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        match cleared {
            Request::UpdateAppointment { notes, fee, .. } => {
                assert_eq!(notes, Some(None));
                assert_eq!(fee, Some(Some(Fee::from_cents(1_250))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_line_is_bad_request() {
        let engine = engine("bad_request.wal");
        let resp = handle_line(&engine, "{not json").await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().kind, "bad_request");

        let resp = handle_line(&engine, r#"{"op":"teleport"}"#).await;
        assert_eq!(resp.error.unwrap().kind, "bad_request");

        let resp = handle_line(
            &engine,
            r#"{"op":"book_appointment","id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","patient_id":"x"}"#,
        )
        .await;
        assert_eq!(resp.error.unwrap().kind, "bad_request");
    }

    #[tokio::test]
    async fn engine_errors_map_to_kinds() {
        let engine = engine("error_kinds.wal");
        let resp = handle_line(
            &engine,
            &format!(r#"{{"op":"get_appointment","id":"{}"}}"#, Ulid::new()),
        )
        .await;
        let err = resp.error.unwrap();
        assert_eq!(err.kind, "not_found");
        assert!(err.message.starts_with("appointment not found"));
    }

    #[tokio::test]
    async fn register_and_list() {
        let engine = engine("register_list.wal");
        let resp = handle_line(
            &engine,
            r#"{"op":"register_doctor","name":"John Doe","department":"Cardiology"}"#,
        )
        .await;
        assert!(resp.ok);
        let data = resp.data.unwrap();
        assert_eq!(data["name"], "John Doe");
        assert!(data["id"].as_str().is_some());

        let resp = handle_line(&engine, r#"{"op":"list_doctors"}"#).await;
        assert_eq!(resp.data.unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn response_omits_empty_fields() {
        let ok = serde_json::to_string(&Response::success(serde_json::json!([]))).unwrap();
        assert_eq!(ok, r#"{"ok":true,"data":[]}"#);
        let err = serde_json::to_string(&Response::failure("not_found", "gone")).unwrap();
        assert_eq!(err, r#"{"ok":false,"error":{"kind":"not_found","message":"gone"}}"#);
    }
}
