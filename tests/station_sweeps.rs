//! End-to-end tests: configuration to station to sweep to recorded run.

use std::io::Write;
use std::time::Duration;

use tempfile::TempDir;

use mesoscope::config::Settings;
use mesoscope::experiment::{create_exp, init_db, DataRole, ExitStatus};
use mesoscope::instrument::{configure_smus, setup_lockins};
use mesoscope::measurement::{lin_array, Spacing, Sweep1d, Sweep2d};
use mesoscope::station::init_station;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    let db_path = dir.path().join("runs");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
[database]
path = "{}"

[station.instruments.mock1]
driver = "mock"

[station.instruments.lockin1]
driver = "sr830"
resource = "mock://lockin1"

[station.instruments.smu1]
driver = "smu"
resource = "mock://smu1"
max_rate = 0.5
voltage_limit = 20.0
current_limit = 1e-8

[sweep]
settle = "1ms"
outer_settle = "1ms"
"#,
        db_path.display()
    )
    .unwrap();
    path
}

#[tokio::test]
async fn gate_sweep_end_to_end() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::load(write_config(&dir)).unwrap();
    let db = init_db(&settings.database.path).unwrap();
    let station = init_station(&settings).await.unwrap();

    // Standard session setup: lock-in reference chain, SMU voltage sourcing.
    assert_eq!(setup_lockins(&station, 127.0, 1.0).await.unwrap(), 1);
    assert_eq!(configure_smus(&station).await.unwrap(), 1);

    let exp = create_exp(&db, "cooldown7", "hall_bar_A");
    let gate = station.find_settable("mock1", "gate").unwrap();
    let x = station.find_readable("mock1", "x").unwrap();
    let current = station.find_readable("mock1", "current").unwrap();

    let array = lin_array(-0.2, 0.2, Spacing::Points(9)).unwrap();
    let summary = Sweep1d::new(gate, array.clone())
        .read(x)
        .read(current)
        .with_defaults(&settings.sweep)
        .named("gate trace")
        .run(&exp)
        .await
        .unwrap();
    assert_eq!(summary.exit_status, ExitStatus::Success);
    assert_eq!(summary.num_events, 9);

    let record = db.load_run(summary.run_id).unwrap();
    let start = record.start.clone().unwrap();
    assert_eq!(start.experiment, "cooldown7");
    assert_eq!(start.sample, "hall_bar_A");
    assert_eq!(start.sweep_kind, "sweep1d");

    let descriptor = record.descriptor("primary").unwrap();
    assert_eq!(
        descriptor.data_keys["mock1.gate"].role,
        DataRole::Setpoint
    );
    assert_eq!(descriptor.data_keys["mock1.x"].role, DataRole::Measured);

    let events = record.stream_events("primary");
    let setpoints: Vec<f64> = events.iter().map(|e| e.positions["mock1.gate"]).collect();
    assert_eq!(setpoints, array);
    // Two measured fields per event.
    assert!(events.iter().all(|e| e.data.len() == 2));

    // Flattened scalar view for downstream consumers.
    let points = record.data_points("primary");
    assert_eq!(points.len(), 18);
    assert!(points.iter().any(|p| p.instrument_id == "mock1" && p.channel == "x"));

    station.close_all().await.unwrap();
}

#[tokio::test]
async fn abort_stops_early_and_keeps_partial_run() {
    let dir = TempDir::new().unwrap();
    let db = init_db(dir.path().join("runs")).unwrap();
    let exp = create_exp(&db, "e", "s");
    let mock = mesoscope::instrument::MockInstrument::new("mock1");

    let array = lin_array(0.0, 1.0, Spacing::Points(100)).unwrap();
    let sweep = Sweep1d::new(mock.gate(), array)
        .read(mock.x())
        .settle(Duration::from_millis(5));
    let abort = sweep.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        abort.abort();
    });

    let summary = sweep.run(&exp).await.unwrap();
    assert_eq!(summary.exit_status, ExitStatus::Abort);
    assert!(summary.num_events > 0);
    assert!(summary.num_events < 100);

    let record = db.load_run(summary.run_id).unwrap();
    assert_eq!(record.stop.unwrap().exit_status, ExitStatus::Abort);
    assert_eq!(record.events.len() as u32, summary.num_events);
}

#[tokio::test]
async fn map_with_measured_retrace_records_both_streams() {
    let dir = TempDir::new().unwrap();
    let db = init_db(dir.path().join("runs")).unwrap();
    let exp = create_exp(&db, "e", "s");
    let mock = mesoscope::instrument::MockInstrument::new("mock1");

    let summary = Sweep2d::new(
        mock.bias(),
        lin_array(0.0, 1e-3, Spacing::Points(3)).unwrap(),
        mock.gate(),
        lin_array(-0.1, 0.1, Spacing::Points(4)).unwrap(),
    )
    .read(mock.x())
    .outer_settle(Duration::from_millis(1))
    .settle(Duration::from_millis(1))
    .measure_retrace(true)
    .named("gate-bias map")
    .run(&exp)
    .await
    .unwrap();

    // Rows 0 and 2 sweep forward (4 points each), row 1 is the measured
    // return trace.
    assert_eq!(summary.num_events, 12);
    let record = db.load_run(summary.run_id).unwrap();
    assert_eq!(record.stream_events("primary").len(), 8);
    let retrace = record.stream_events("retrace");
    assert_eq!(retrace.len(), 4);
    // The retrace row runs the fast axis backwards at the middle bias value.
    assert!(retrace[0].positions["mock1.gate"] > retrace[3].positions["mock1.gate"]);
    assert!((retrace[0].positions["mock1.bias"] - 5e-4).abs() < 1e-12);
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn recorded_run_exports_to_csv() {
    use mesoscope::data::CsvExporter;

    let dir = TempDir::new().unwrap();
    let db = init_db(dir.path().join("runs")).unwrap();
    let exp = create_exp(&db, "e", "s");
    let mock = mesoscope::instrument::MockInstrument::new("mock1");

    let summary = Sweep1d::new(mock.gate(), vec![0.0, 0.1, 0.2])
        .read(mock.x())
        .settle(Duration::from_millis(1))
        .run(&exp)
        .await
        .unwrap();

    let out = dir.path().join("export.csv");
    CsvExporter::new()
        .export(&db, summary.run_id, "primary", &out)
        .unwrap();
    let contents = std::fs::read_to_string(&out).unwrap();
    let data_lines: Vec<&str> = contents.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(data_lines.len(), 4);
    assert!(data_lines[0].contains("mock1.gate"));
    assert!(data_lines[0].contains("mock1.x"));
}
