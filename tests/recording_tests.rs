mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{MockDrive, MockReply};
use servo_fleet::telemetry::{
    capture_fault, record_streams, FaultTrigger, MemorySink, RecordStream, RecorderConfig,
    TelemetrySink,
};
use servo_fleet::{CancelToken, DriveError, DriveSession};

/// Test sink that leaves its rows inspectable after the recording owns
/// the boxed sink.
struct SharedSink(Arc<Mutex<MemorySink>>);

#[async_trait]
impl TelemetrySink for SharedSink {
    async fn write_header(&mut self, header: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().header = Some(header.to_string());
        Ok(())
    }

    async fn write_row(&mut self, row: &[f64]) -> anyhow::Result<()> {
        self.0.lock().unwrap().rows.push(row.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn sequence(items: &[&str]) -> MockReply {
    MockReply::Sequence(items.iter().map(|s| s.to_string()).collect::<VecDeque<_>>())
}

#[tokio::test]
async fn continuous_recording_decodes_and_drains() {
    let mock = MockDrive::start("axis1").await;
    mock.set_reply(
        "rec.retrievehdr",
        MockReply::Payload("Recording\r\n2,500\r\nIL.FB,VL.FB".into()),
    );
    // First line of every retrieval is status, not data. F31F40 = 0x1F40
    // * 10^-3 = 8.0; plain hex A = 10.
    mock.set_reply(
        "rec.retrievedata",
        sequence(&["ok\r\nF31F40,A", "ok\r\nF3-1F40,B", "ok"]),
    );

    let session = DriveSession::connect(mock.endpoint(), MockDrive::timeouts())
        .await
        .unwrap();

    let store = Arc::new(Mutex::new(MemorySink::default()));
    let stream = RecordStream {
        session,
        channels: vec!["IL.FB".into(), "VL.FB".into()],
        sink: Box::new(SharedSink(Arc::clone(&store))),
    };

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    record_streams(vec![stream], 8_000.0, None, cancel)
        .await
        .unwrap();

    let sink = store.lock().unwrap();
    assert_eq!(sink.header.as_deref(), Some("time [s],IL.FB,VL.FB"));
    assert!(sink.rows.len() >= 2);
    // Synthetic timestamps advance by 1/effective frequency.
    assert_eq!(sink.rows[0], vec![0.0, 8.0, 10.0]);
    assert_eq!(sink.rows[1], vec![1.0 / 8_000.0, -8.0, 11.0]);

    let commands = mock.commands();
    assert!(commands.contains(&"rec.gap 2".to_string()));
    assert!(commands.contains(&"rec.retrievefrmt 1".to_string()));
    assert!(commands.contains(&"rec.stoptype 1".to_string()));
    assert!(commands.contains(&"rec.ch1 IL.FB".to_string()));
    assert!(commands.contains(&"rec.ch2 VL.FB".to_string()));
    // Unused hardware slots are explicitly cleared.
    for slot in 3..=6 {
        assert!(commands.contains(&format!("rec.ch{} clear", slot)));
    }
    // The recording was turned off on the way out.
    assert!(commands.iter().filter(|c| *c == "rec.off").count() >= 2);
}

#[tokio::test]
async fn seven_channels_is_a_recording_limit_error() {
    let mock = MockDrive::start("axis1").await;
    let mut session = DriveSession::connect(mock.endpoint(), MockDrive::timeouts())
        .await
        .unwrap();

    let channels = (1..=7).map(|i| format!("CH{}", i)).collect();
    let cfg = RecorderConfig::new(1_000.0, channels);
    let err = servo_fleet::telemetry::Recorder::configure(&mut session, &cfg)
        .await
        .unwrap_err();
    assert!(matches!(err, DriveError::RecordingLimit(7)));
}

#[tokio::test]
async fn trigger_stream_pulses_digital_output() {
    let mock = MockDrive::start("axis1").await;
    mock.set_reply(
        "rec.retrievehdr",
        MockReply::Payload("h\r\nx\r\nIL.FB".into()),
    );

    let session = DriveSession::connect(mock.endpoint(), MockDrive::timeouts())
        .await
        .unwrap();
    let stream = RecordStream {
        session,
        channels: vec!["IL.FB".into()],
        sink: Box::new(MemorySink::default()),
    };

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    record_streams(vec![stream], 1_000.0, Some(0), cancel)
        .await
        .unwrap();

    let commands = mock.commands();
    let pulses: Vec<&str> = commands
        .iter()
        .filter(|c| c.starts_with("dout1.stateu"))
        .map(|c| c.as_str())
        .collect();
    assert_eq!(
        pulses,
        vec!["dout1.stateu 0", "dout1.stateu 0", "dout1.stateu 1", "dout1.stateu 0"]
    );
}

#[tokio::test]
async fn fault_capture_records_the_window() {
    let mock = MockDrive::start("axis1").await;
    // Two clean polls (debounce), one more clean poll after arming, then
    // the fault appears.
    mock.set_reply("drv.fault1", sequence(&["0", "0", "0", "501"]));
    mock.set_reply("drv.fault2", MockReply::Payload("0".into()));
    mock.set_reply("rec.done", MockReply::Payload("1".into()));
    mock.set_reply(
        "rec.retrievehdr",
        MockReply::Payload("h\r\nx\r\nIL.FB".into()),
    );
    // F264 = 0x64 * 10^-2 = 1.0
    mock.set_reply("rec.retrievedata", sequence(&["ok\r\nF264", "ok"]));

    let mut session = DriveSession::connect(mock.endpoint(), MockDrive::timeouts())
        .await
        .unwrap();

    let cfg = RecorderConfig::new(1_000.0, vec!["IL.FB".into()]);
    let trigger = FaultTrigger::new("drv.motionstat", 1 << 13, 1 << 13);
    let capture = capture_fault(&mut session, &cfg, &trigger, &CancelToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(capture.fault_code, "F501");
    assert_eq!(capture.header, "time [s],IL.FB");
    assert_eq!(capture.rows, vec![vec![0.0, 1.0]]);
    assert!(capture.file_name().contains("F501"));

    let commands = mock.commands();
    assert!(commands.contains(&"rec.trigtype 5".to_string()));
    assert!(commands.contains(&"rec.trigparam drv.motionstat".to_string()));
    assert!(commands.contains(&format!("rec.trigmask {}", 1 << 13)));
}

#[tokio::test]
async fn fault_capture_stopped_before_fault_is_empty_not_error() {
    let mock = MockDrive::start("axis1").await;
    mock.set_reply("drv.fault1", MockReply::Payload("0".into()));
    mock.set_reply(
        "rec.retrievehdr",
        MockReply::Payload("h\r\nx\r\nIL.FB".into()),
    );

    let session = DriveSession::connect(mock.endpoint(), MockDrive::timeouts())
        .await
        .unwrap();

    let cancel = CancelToken::new();
    let inner = cancel.clone();
    let handle = tokio::spawn(async move {
        let mut session = session;
        let cfg = RecorderConfig::new(1_000.0, vec!["IL.FB".into()]);
        let trigger = FaultTrigger::new("drv.motionstat", 1 << 13, 1 << 13);
        capture_fault(&mut session, &cfg, &trigger, &inner).await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();

    let result = handle.await.unwrap().unwrap();
    assert!(result.is_none());
}
