use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use medislot::engine::{Engine, EngineError, EngineOptions, Rejection};
use medislot::model::{NewAppointment, Timestamp};
use medislot::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let max = latencies[latencies.len() - 1];
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        max.as_secs_f64() * 1000.0,
    );
}

struct Practice {
    doctor: Ulid,
    /// One 00:00-23:59 slot per day, starting 2025-01-01.
    slots: Vec<(NaiveDate, Ulid)>,
    patients: Vec<Ulid>,
}

fn fresh_engine(label: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("medislot_bench_{label}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(
        Engine::new(
            dir.join("bench.wal"),
            Arc::new(NotifyHub::new()),
            EngineOptions::default(),
        )
        .unwrap(),
    )
}

async fn setup(engine: &Engine, days: u32, patients: usize) -> Practice {
    let doctor = Ulid::new();
    engine
        .register_doctor(doctor, "Bench Doctor".into(), None)
        .await
        .unwrap();

    let first = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let mut slots = Vec::new();
    for d in 0..days {
        let date = first + TimeDelta::days(d as i64);
        let slot = Ulid::new();
        engine
            .publish_slot(
                slot,
                doctor,
                date,
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            )
            .await
            .unwrap();
        slots.push((date, slot));
    }

    let mut ids = Vec::new();
    for i in 0..patients {
        let id = Ulid::new();
        engine
            .register_patient(id, format!("Patient {i}"), format!("p{i}@bench.test"))
            .await
            .unwrap();
        ids.push(id);
    }

    Practice {
        doctor,
        slots,
        patients: ids,
    }
}

fn quarter_hour(date: NaiveDate, i: usize) -> (Timestamp, Timestamp) {
    let start = date.and_hms_opt(0, 0, 0).unwrap() + TimeDelta::minutes(15 * i as i64);
    (start, start + TimeDelta::minutes(15))
}

async fn phase1_sequential() {
    let engine = fresh_engine("sequential");
    let practice = setup(&engine, 22, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let (date, slot) = practice.slots[i / 95];
        let (s, e) = quarter_hour(date, i % 95);
        let t = Instant::now();
        engine
            .create_appointment(NewAppointment {
                id: Ulid::new(),
                patient_id: Some(practice.patients[0]),
                doctor_id: practice.doctor,
                schedule_id: slot,
                start: s,
                end: e,
                notes: None,
                fee: None,
            })
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} appointments in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_contended_booking() {
    let engine = fresh_engine("contended");
    let practice = Arc::new(setup(&engine, 1, 50).await);
    let (date, slot) = practice.slots[0];

    let rounds = 40;
    let mut winners = 0;
    let mut rejected = 0;
    let start = Instant::now();

    for r in 0..rounds {
        let (s, e) = quarter_hour(date, r);
        let open = engine
            .create_appointment(NewAppointment {
                id: Ulid::new(),
                patient_id: None,
                doctor_id: practice.doctor,
                schedule_id: slot,
                start: s,
                end: e,
                notes: None,
                fee: None,
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for &patient in &practice.patients {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.book_appointment(open.id, patient, None).await
            }));
        }
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(EngineError::InvalidState(Rejection::AlreadyBooked)) => rejected += 1,
                Err(e) => panic!("unexpected booking error: {e}"),
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} slots x {} patients: {winners} booked, {rejected} rejected in {:.2}s",
        practice.patients.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(winners, rounds, "exactly one booking per slot");
}

async fn phase3_read_under_load() {
    let engine = fresh_engine("reads");
    let practice = Arc::new(setup(&engine, 30, 1).await);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let engine = engine.clone();
        let practice = practice.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) && i < 30 * 95 {
                let (date, slot) = practice.slots[i / 95];
                let (s, e) = quarter_hour(date, i % 95);
                let _ = engine
                    .create_appointment(NewAppointment {
                        id: Ulid::new(),
                        patient_id: None,
                        doctor_id: practice.doctor,
                        schedule_id: slot,
                        start: s,
                        end: e,
                        notes: None,
                        fee: None,
                    })
                    .await;
                i += 1;
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let doctor = practice.doctor;
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for _ in 0..500 {
                let t = Instant::now();
                let _ = engine.available_for_doctor(&doctor).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = writer.await;

    print_latency("available_for_doctor", &mut all);
}

#[tokio::main]
async fn main() {
    println!("=== medislot stress benchmark ===\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent booking of the same open appointment");
    phase2_contended_booking().await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load().await;

    println!("\n=== done ===");
}
