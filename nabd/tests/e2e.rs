//! End-to-end tests for the nabd daemon
//!
//! Each test boots a complete daemon on an ephemeral port with the virtual
//! hardware backend and drives it over the real TCP protocol with
//! `nab_common::client::NabClient`. Scripted sensor input goes through the
//! virtual handle, and hardware effects are asserted against its journal.

use std::sync::Arc;
use std::time::Duration;

use nab_common::client::NabClient;
use nab_common::{
    ButtonEventKind, Frame, Packet, RabbitState, Response, Status, TagUid,
};
use nabd::config::ConfigManager;
use nabd::virt::VirtualHandle;
use nabd::Daemon;
use tempfile::TempDir;
use tokio::time::timeout;

/// Test environment with a fully wired daemon
struct TestEnvironment {
    daemon: Daemon,
    _media: TempDir,
}

impl TestEnvironment {
    async fn new() -> Self {
        // Set up logging for tests; later calls are no-ops
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let media = TempDir::new().unwrap();
        write_media(&media, "test/sounds/ping.wav", &make_wav_ms(200));
        write_media(&media, "test/sounds/slow.wav", &make_wav_ms(3000));
        write_media(&media, "test/sounds/beep.wav", &make_wav_ms(100));
        write_media(
            &media,
            "test/chors/spin.chor",
            br#"{"frames":[
                {"tempo":2,"leds":["ff0000",null,null,null,null]},
                {"leds":[null,"00ff00",null,null,null]},
                {"leds":[null,null,"0000ff",null,null],"ears":{"left":5,"right":-5}}
            ]}"#,
        );

        let config_path = media.path().join("config.yaml");
        let config = format!(
            "daemon:\n  bind_addr: 127.0.0.1\n  port: 0\n  log_level: debug\n\
             media:\n  root: {}\n  locale: en_US\n\
             scheduler:\n  rfid_write_timeout: 2.0\n\
             virt:\n  enabled: true\n  seed: 42\n",
            media.path().display()
        );
        std::fs::write(&config_path, config).unwrap();

        let config_manager = Arc::new(ConfigManager::new(&config_path).await.unwrap());
        let daemon = Daemon::start(config_manager).await.unwrap();

        Self { daemon, _media: media }
    }

    fn virt(&self) -> &VirtualHandle {
        self.daemon.virt.as_ref().unwrap()
    }

    /// Connect, consume the handshake state frame, subscribe to `events`.
    async fn client(&self, events: &[&str]) -> NabClient {
        let mut client = NabClient::connect(self.daemon.addr.to_string()).await.unwrap();

        let handshake = client
            .next_event_timeout(Duration::from_secs(5))
            .await
            .expect("no handshake state frame");
        assert!(matches!(handshake, Frame::State { .. }));

        if !events.is_empty() {
            let response = client
                .send(&Packet::Mode {
                    request_id: Some("mode-setup".to_string()),
                    mode: None,
                    events: Some(events.iter().map(|s| s.to_string()).collect()),
                })
                .await
                .unwrap();
            assert_eq!(response.status, Status::Ok);
        }
        client
    }

    fn journal_calls(&self) -> Vec<String> {
        self.virt().journal().into_iter().map(|(_, call)| call).collect()
    }
}

fn write_media(dir: &TempDir, rel: &str, contents: &[u8]) {
    let path = dir.path().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Header-only WAV whose nominal duration is `ms` milliseconds.
fn make_wav_ms(ms: u32) -> Vec<u8> {
    let rate = 1000u32; // 1 byte per millisecond at 8-bit mono
    let data_len = ms;
    let mut wav = Vec::new();
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&rate.to_le_bytes());
    wav.extend_from_slice(&rate.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&8u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav
}

fn audio_command(request_id: &str, sound: &str) -> Packet {
    Packet::Command {
        request_id: Some(request_id.to_string()),
        sequence: vec![nab_common::CommandItem {
            audio: Some(vec![sound.to_string()]),
            choreography: None,
        }],
        cancelable: None,
        expiration: None,
    }
}

/// Wait for the next response frame with the given request_id, skipping
/// state and sensor broadcasts.
async fn response_for(client: &mut NabClient, request_id: &str) -> Response {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let frame = timeout(Duration::from_secs(10), client.next_event())
            .await
            .expect("timed out waiting for response")
            .expect("connection closed");
        if let Frame::Response(response) = frame {
            if response.request_id.as_deref() == Some(request_id) {
                return response;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "response never arrived");
    }
}

/// Wait until a state frame with the given state arrives.
async fn wait_state(client: &mut NabClient, state: RabbitState) {
    loop {
        let frame = timeout(Duration::from_secs(10), client.next_event())
            .await
            .expect("timed out waiting for state")
            .expect("connection closed");
        if matches!(frame, Frame::State { state: s } if s == state) {
            return;
        }
    }
}

/// S1: basic playback runs idle -> playing -> idle and plays the clip once.
#[tokio::test]
async fn test_basic_playback() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    let response = client
        .send(&audio_command("a1", "test/sounds/ping.wav"))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);

    wait_state(&mut client, RabbitState::Playing).await;
    wait_state(&mut client, RabbitState::Idle).await;

    let calls = env.journal_calls();
    let plays = calls.iter().filter(|c| *c == "audio played test/sounds/ping.wav").count();
    assert_eq!(plays, 1);
}

/// S2: cancel mid-play flushes audio, clears LEDs, answers canceled.
#[tokio::test]
async fn test_cancel_mid_play() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    client
        .send_nowait(&audio_command("a2", "test/sounds/slow.wav"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    client
        .send_nowait(&Packet::Cancel { request_id: "a2".to_string() })
        .await
        .unwrap();

    let response = response_for(&mut client, "a2").await;
    assert_eq!(response.status, Status::Canceled);
    wait_state(&mut client, RabbitState::Idle).await;

    assert!(env.journal_calls().iter().any(|c| c.starts_with("audio flush")));
    assert!(env.virt().led_snapshot().iter().all(|c| c.is_black()));
}

/// S3: an already-expired command touches no hardware.
#[tokio::test]
async fn test_expiration_purity() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    let response = client
        .send(&Packet::Command {
            request_id: Some("a3".to_string()),
            sequence: vec![nab_common::CommandItem {
                audio: Some(vec!["test/sounds/ping.wav".to_string()]),
                choreography: None,
            }],
            cancelable: None,
            expiration: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
        })
        .await
        .unwrap();
    assert_eq!(response.status, Status::Expired);
    assert!(response.class.is_none());

    assert!(!env.journal_calls().iter().any(|c| c.contains("ping.wav")));
}

/// S4: interactive is granted only after the running item completes, the
/// owner's commands bypass, and release returns to idle.
#[tokio::test]
async fn test_interactive_preemption() {
    let env = TestEnvironment::new().await;
    let mut a = env.client(&[]).await;
    let mut b = env.client(&[]).await;

    a.send_nowait(&audio_command("a4", "test/sounds/slow.wav")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    b.send_nowait(&Packet::Mode {
        request_id: Some("m1".to_string()),
        mode: Some(nab_common::ModeKind::Interactive),
        events: None,
    })
    .await
    .unwrap();
    b.send_nowait(&audio_command("b1", "test/sounds/beep.wav")).await.unwrap();

    // The grant waits for a4
    let a4 = response_for(&mut a, "a4").await;
    assert_eq!(a4.status, Status::Ok);
    wait_state(&mut b, RabbitState::Interactive).await;
    let granted = response_for(&mut b, "m1").await;
    assert_eq!(granted.status, Status::Ok);

    let b1 = response_for(&mut b, "b1").await;
    assert_eq!(b1.status, Status::Ok);

    // a4 finished playing before b1 was even enqueued on the sink
    let calls = env.journal_calls();
    let a4_done = calls.iter().position(|c| c == "audio played test/sounds/slow.wav").unwrap();
    let b1_start = calls.iter().position(|c| c == "audio enqueue test/sounds/beep.wav").unwrap();
    assert!(a4_done < b1_start);

    let release = b
        .send(&Packet::Mode {
            request_id: Some("m2".to_string()),
            mode: Some(nab_common::ModeKind::Idle),
            events: None,
        })
        .await
        .unwrap();
    assert_eq!(release.status, Status::Ok);
    wait_state(&mut b, RabbitState::Idle).await;
}

/// S5: a sleep barrier is acknowledged only after everything queued before
/// and after it has completed, then wakeup returns to idle.
#[tokio::test]
async fn test_sleep_queues_behind() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    client.send_nowait(&audio_command("x", "test/sounds/ping.wav")).await.unwrap();
    client
        .send_nowait(&Packet::Sleep { request_id: Some("z".to_string()) })
        .await
        .unwrap();
    client.send_nowait(&audio_command("y", "test/sounds/beep.wav")).await.unwrap();

    // Responses arrive x, y, z: the sleep migrated behind y. The asleep
    // state frame lands just before the sleep acknowledgement.
    let mut order = Vec::new();
    let mut saw_asleep = false;
    while order.len() < 3 {
        let frame = timeout(Duration::from_secs(10), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        match frame {
            Frame::Response(response) => {
                assert_eq!(response.status, Status::Ok);
                order.push(response.request_id.unwrap());
            }
            Frame::State { state: RabbitState::Asleep } => saw_asleep = true,
            _ => {}
        }
    }
    assert_eq!(order, vec!["x", "y", "z"]);
    assert!(saw_asleep);

    let wake = client
        .send(&Packet::Wakeup { request_id: Some("w".to_string()) })
        .await
        .unwrap();
    assert_eq!(wake.status, Status::Ok);
    wait_state(&mut client, RabbitState::Idle).await;
}

/// S6: subscription filtering on rfid events.
#[tokio::test]
async fn test_subscription_filter() {
    let env = TestEnvironment::new().await;
    let mut a = env.client(&["rfid/weather"]).await;
    let mut b = env.client(&["rfid/*"]).await;

    env.virt()
        .inject("rfid detected st25tb d0:02:1a:05 formatted weather")
        .await
        .unwrap();

    for client in [&mut a, &mut b] {
        let frame = timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        assert!(matches!(frame, Frame::RfidEvent { .. }));
    }

    env.virt()
        .inject("rfid detected st25tb d0:02:1a:06 formatted clock")
        .await
        .unwrap();

    // B sees the clock tag; A sees nothing further
    let frame = timeout(Duration::from_secs(5), b.next_event())
        .await
        .expect("timed out")
        .expect("closed");
    assert!(matches!(frame, Frame::RfidEvent { .. }));
    assert!(a.next_event_timeout(Duration::from_millis(300)).await.is_none());
}

/// Property 1: FIFO within a writer, both for responses and hardware order.
#[tokio::test]
async fn test_fifo_within_writer() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    for id in ["c1", "c2", "c3"] {
        client.send_nowait(&audio_command(id, "test/sounds/beep.wav")).await.unwrap();
    }

    let mut order = Vec::new();
    while order.len() < 3 {
        let frame = timeout(Duration::from_secs(10), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        if let Frame::Response(response) = frame {
            order.push(response.request_id.unwrap());
        }
    }
    assert_eq!(order, vec!["c1", "c2", "c3"]);
}

/// Property 4: a second cancel of the same request_id answers error.
#[tokio::test]
async fn test_cancel_idempotence() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    client.send_nowait(&audio_command("dup", "test/sounds/slow.wav")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..2 {
        client
            .send_nowait(&Packet::Cancel { request_id: "dup".to_string() })
            .await
            .unwrap();
    }

    let mut statuses = Vec::new();
    while statuses.len() < 2 {
        let frame = timeout(Duration::from_secs(10), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        if let Frame::Response(response) = frame {
            assert_eq!(response.request_id.as_deref(), Some("dup"));
            statuses.push(response.status);
        }
    }
    assert!(statuses.contains(&Status::Canceled));
    assert!(statuses.contains(&Status::Error));
}

/// Property 7 sibling: a button subscriber receives no ear events, and a
/// short click cancels cancelable playback.
#[tokio::test]
async fn test_button_click_cancels() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&["button"]).await;

    client.send_nowait(&audio_command("k1", "test/sounds/slow.wav")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    env.virt().inject("ear left 3").await.unwrap();
    env.virt().inject("button click").await.unwrap();

    let response = response_for(&mut client, "k1").await;
    assert_eq!(response.status, Status::Canceled);

    // The click was broadcast, the ear event filtered out
    let mut saw_button = false;
    while let Some(frame) = client.next_event_timeout(Duration::from_millis(300)).await {
        match frame {
            Frame::ButtonEvent { event: ButtonEventKind::Click, .. } => saw_button = true,
            Frame::EarEvent { .. } => panic!("ear event leaked past the filter"),
            _ => {}
        }
    }
    assert!(saw_button);
}

/// Property 8: the same choreography produces the same hardware calls.
#[tokio::test]
async fn test_choreography_determinism() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    let command = Packet::Command {
        request_id: Some("spin1".to_string()),
        sequence: vec![nab_common::CommandItem {
            audio: None,
            choreography: Some("test/chors/spin.chor".to_string()),
        }],
        cancelable: None,
        expiration: None,
    };
    let response = client.send(&command).await.unwrap();
    assert_eq!(response.status, Status::Ok);
    let first: Vec<String> = env.journal_calls();

    let command = Packet::Command {
        request_id: Some("spin2".to_string()),
        sequence: vec![nab_common::CommandItem {
            audio: None,
            choreography: Some("test/chors/spin.chor".to_string()),
        }],
        cancelable: None,
        expiration: None,
    };
    let response = client.send(&command).await.unwrap();
    assert_eq!(response.status, Status::Ok);
    let full: Vec<String> = env.journal_calls();
    let second = &full[first.len()..];

    let picks = |calls: &[String]| -> Vec<String> {
        calls
            .iter()
            .filter(|c| c.starts_with("leds") || c.starts_with("ear"))
            .cloned()
            .collect()
    };
    assert_eq!(picks(&first), picks(second));
    assert!(!picks(&first).is_empty());
}

/// rfid_write stores the tag picture and later formatted detections of the
/// same app are annotated with it.
#[tokio::test]
async fn test_rfid_write_and_annotation() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&["rfid/*"]).await;

    let response = client
        .send(&Packet::RfidWrite {
            request_id: Some("w1".to_string()),
            tech: "st25tb".to_string(),
            uid: TagUid::parse("d0:02:1a:05").unwrap(),
            picture: 7,
            app: "weather".to_string(),
            data: None,
            timeout: None,
        })
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.uid, Some(TagUid::parse("d0:02:1a:05").unwrap()));

    env.virt()
        .inject("rfid detected st25tb d0:02:1a:05 formatted weather")
        .await
        .unwrap();

    loop {
        let frame = timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        if let Frame::RfidEvent { picture, .. } = frame {
            assert_eq!(picture, Some(7));
            break;
        }
    }
}

/// Gestalt answers uptime, state and hardware summary inline.
#[tokio::test]
async fn test_gestalt() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    let response = client
        .send(&Packet::Gestalt { request_id: Some("g1".to_string()) })
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);

    let info = response.info.expect("gestalt info payload");
    assert_eq!(info["state"], "idle");
    assert!(info["hardware"].as_str().unwrap().contains("leds"));
    assert!(info["connected_writers"].as_array().unwrap().len() >= 1);
}

/// Malformed and unknown packets answer errors without dropping the link.
#[tokio::test]
async fn test_protocol_errors_keep_connection() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let env = TestEnvironment::new().await;
    let stream = tokio::net::TcpStream::connect(env.daemon.addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Handshake
    let handshake = lines.next_line().await.unwrap().unwrap();
    assert!(handshake.contains("\"state\""));

    write_half.write_all(b"this is not json\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(line.contains("ProtocolError"));

    write_half
        .write_all(b"{\"type\":\"command\",\"request_id\":\"bad\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(line.contains("MissingField"));
    assert!(line.contains("bad"));

    // Still alive: a valid packet round-trips
    write_half
        .write_all(b"{\"type\":\"gestalt\",\"request_id\":\"g\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(line.contains("\"ok\""));
}

/// Idle animations rotate while idle and stop for queued work.
#[tokio::test]
async fn test_idle_animation() {
    let env = TestEnvironment::new().await;
    let mut client = env.client(&[]).await;

    let response = client
        .send(&Packet::Info {
            request_id: Some("i1".to_string()),
            info_id: Some("weather".to_string()),
            animation: Some(nab_common::IdleAnimation {
                tempo: 0.05,
                colors: vec![
                    nab_common::AnimationFrame {
                        left: Some(nab_common::Color::new(0xff, 0, 0)),
                        center: None,
                        right: None,
                    },
                    nab_common::AnimationFrame {
                        left: Some(nab_common::Color::BLACK),
                        center: None,
                        right: None,
                    },
                ],
            }),
        })
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let writes = env.journal_calls().iter().filter(|c| c.starts_with("leds")).count();
    assert!(writes > 0, "idle animation never drove the LEDs");

    // Queued work interrupts the rotation and still completes normally
    let response = client
        .send(&audio_command("after-idle", "test/sounds/beep.wav"))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);
}

/// The virtual view socket renders the rabbit and accepts script lines.
#[tokio::test]
async fn test_virtual_view() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let env = TestEnvironment::new().await;
    let mut client = env.client(&["button"]).await;

    let view_addr = env.daemon.view_addr.expect("virtual view not bound");
    let mut view = tokio::net::TcpStream::connect(view_addr).await.unwrap();

    let mut buffer = vec![0u8; 4096];
    let read = timeout(Duration::from_secs(5), view.read(&mut buffer)).await.unwrap().unwrap();
    let frame = String::from_utf8_lossy(&buffer[..read]);
    assert!(frame.contains("nabd virtual rabbit"));

    view.write_all(b"button click\n").await.unwrap();
    loop {
        let frame = timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("timed out")
            .expect("closed");
        if matches!(frame, Frame::ButtonEvent { event: ButtonEventKind::Click, .. }) {
            break;
        }
    }

}
