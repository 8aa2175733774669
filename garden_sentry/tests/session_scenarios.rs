mod common;

use common::*;
use garden_sentry::{Detection, SessionEvent, SessionReport, SessionState, Supervisor};
use std::fs;
use tokio::sync::{broadcast, watch};

type TestSupervisor = Supervisor<ScriptedConnector, ScriptedClassifier, MemoryEncoder>;

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn run_script(
    dir: &std::path::Path,
    sessions: Vec<Vec<Item>>,
    detections: Vec<Option<Vec<Detection>>>,
    encoder: MemoryEncoder,
) -> (TestSupervisor, SessionReport, Vec<SessionEvent>) {
    let (tx, rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(
        config(dir),
        ScriptedConnector::new(sessions, tx),
        ScriptedClassifier::new(detections),
        encoder,
    );
    let mut events = supervisor.subscribe();
    let report = supervisor.run(rx).await;
    let events = drain(&mut events);
    (supervisor, report, events)
}

fn files(supervisor: &TestSupervisor) -> &[EncodedFile] {
    &supervisor.recorder().writer().backend().files
}

#[tokio::test(start_paused = true)]
async fn short_gap_keeps_one_continuous_episode() {
    let dir = tempfile::tempdir().unwrap();
    let mut detections = repeat(cat(0.9), 10);
    detections.extend(repeat(nothing(), 3));
    detections.push(cat(0.8));
    detections.extend(repeat(nothing(), 4));

    let (supervisor, report, _) = run_script(dir.path(), vec![frames(18)], detections, MemoryEncoder::default()).await;

    let files = files(&supervisor);
    assert_eq!(files.len(), 1);
    // Last sighting at 13, closed by the absence timeout at 17.
    assert_eq!(files[0].frames, (0..=17).collect::<Vec<u64>>());
    assert!(files[0].released);
    assert_eq!(report.episodes_started, 1);
    assert_eq!(report.episodes_finalized, 1);
}

#[tokio::test(start_paused = true)]
async fn long_gap_splits_into_two_episodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut detections = repeat(cat(0.9), 10);
    detections.extend(repeat(nothing(), 5));
    detections.extend(repeat(cat(0.8), 5));

    let (supervisor, report, events) =
        run_script(dir.path(), vec![frames(20)], detections, MemoryEncoder::default()).await;

    let files = files(&supervisor);
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].frames, (0..=13).collect::<Vec<u64>>());
    assert_eq!(files[1].frames, (15..=19).collect::<Vec<u64>>());
    assert!(files.iter().all(|f| f.released));
    assert_eq!(report.episodes_finalized, 2);

    let finalized: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::EpisodeFinalized(artifact) => Some(artifact.frames),
            _ => None,
        })
        .collect();
    assert_eq!(finalized, [14, 5]);
}

#[tokio::test(start_paused = true)]
async fn read_fault_while_recording_finalizes_then_backs_off() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = frames(6);
    first.push(Item::Fault);
    let sessions = vec![first, frames(2)];

    let (supervisor, report, events) =
        run_script(dir.path(), sessions, repeat(cat(0.9), 6), MemoryEncoder::default()).await;

    let files = files(&supervisor);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].frames, (0..6).collect::<Vec<u64>>());
    assert!(files[0].released);

    assert_eq!(report.read_faults, 1);
    assert_eq!(report.sessions, 2);
    assert_eq!(supervisor.connector().closes, 2);

    let finalized = events
        .iter()
        .position(|e| matches!(e, SessionEvent::EpisodeFinalized(a) if a.frames == 6))
        .unwrap();
    let fault = events
        .iter()
        .position(|e| matches!(e, SessionEvent::ReadFault { .. }))
        .unwrap();
    let backoff = events
        .iter()
        .position(|e| matches!(e, SessionEvent::StateChanged { to: SessionState::Backoff, .. }))
        .unwrap();
    let reconnect = events
        .iter()
        .enumerate()
        .skip(backoff)
        .find(|(_, e)| matches!(e, SessionEvent::StateChanged { to: SessionState::Connecting, .. }))
        .map(|(i, _)| i)
        .unwrap();
    assert!(finalized < fault);
    assert!(fault < backoff);
    assert!(backoff < reconnect);
}

#[tokio::test(start_paused = true)]
async fn empty_frame_is_treated_as_a_read_fault() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = frames(3);
    first.push(Item::Empty);

    let (supervisor, report, _) =
        run_script(dir.path(), vec![first], repeat(cat(0.9), 3), MemoryEncoder::default()).await;

    assert_eq!(report.read_faults, 1);
    assert_eq!(files(&supervisor)[0].frames, [0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn fallback_codec_is_visible_in_events_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _, events) = run_script(
        dir.path(),
        vec![frames(3)],
        repeat(cat(0.9), 3),
        MemoryEncoder::with_broken(&["avc1"]),
    )
    .await;

    let started = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::EpisodeStarted { codec, used_fallback, .. } => Some((codec.to_string(), *used_fallback)),
            _ => None,
        })
        .unwrap();
    assert_eq!(started, ("mp4v".to_string(), true));

    let file = &files(&supervisor)[0];
    assert_eq!(file.codec, "mp4v");
    let sidecar: serde_json::Value =
        serde_json::from_slice(&fs::read(file.path.with_extension("json")).unwrap()).unwrap();
    assert_eq!(sidecar["codec"], "mp4v");
    assert_eq!(sidecar["used_fallback"], true);
    assert_eq!(sidecar["frames"], 3);
    assert_eq!(sidecar["best_label"], "cat");
}

#[tokio::test(start_paused = true)]
async fn no_codec_aborts_the_attempt_but_not_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, report, _) = run_script(
        dir.path(),
        vec![frames(3)],
        repeat(cat(0.9), 3),
        MemoryEncoder::with_broken(&["avc1", "mp4v"]),
    )
    .await;

    assert!(files(&supervisor).is_empty());
    // Each present frame retries the open.
    assert_eq!(report.episodes_aborted, 3);
    assert_eq!(report.frames, 3);
    assert_eq!(report.read_faults, 0);
}

#[tokio::test(start_paused = true)]
async fn classifier_errors_do_not_break_the_episode() {
    let dir = tempfile::tempdir().unwrap();
    let detections = vec![cat(0.9), None, None, cat(0.85), nothing()];

    let (supervisor, report, _) =
        run_script(dir.path(), vec![frames(5)], detections, MemoryEncoder::default()).await;

    assert_eq!(report.classifier_errors, 2);
    let files = files(&supervisor);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].frames, [0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn suppressing_label_prevents_recording() {
    let dir = tempfile::tempdir().unwrap();
    let confounded = Some(vec![Detection::new("cat", 0.95), Detection::new("bird", 0.7)]);

    let (supervisor, report, _) =
        run_script(dir.path(), vec![frames(4)], repeat(confounded, 4), MemoryEncoder::default()).await;

    assert!(files(&supervisor).is_empty());
    assert_eq!(report.episodes_started, 0);
    assert_eq!(report.frames, 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_tears_down_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, report, events) =
        run_script(dir.path(), vec![frames(2)], repeat(cat(0.9), 2), MemoryEncoder::default()).await;

    assert!(supervisor.is_finished());
    assert!(supervisor.classifier().released);
    assert_eq!(supervisor.recorder().writer().backend().open_files(), 0);
    assert_eq!(supervisor.state(), SessionState::ShuttingDown);
    assert_eq!(report.connect_attempts, 2);
    assert!(matches!(
        events.last(),
        Some(SessionEvent::StateChanged { to: SessionState::ShuttingDown, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_episode_finalizes_then_closes_then_releases() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let (tx, mut rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(
        config(dir.path()),
        ScriptedConnector::new(vec![frames(10)], tx).with_journal(&journal),
        ScriptedClassifier::new(repeat(cat(0.9), 10)).with_journal(&journal),
        MemoryEncoder::default().with_journal(&journal),
    );

    for _ in 0..4 {
        supervisor.step(&mut rx).await;
    }
    assert_eq!(supervisor.state(), SessionState::Streaming);
    assert_eq!(supervisor.recorder().open_episodes(), 1);
    assert!(journal.lock().unwrap().is_empty());

    supervisor.connector().request_shutdown();
    let report = supervisor.run(rx).await;

    assert_eq!(*journal.lock().unwrap(), ["finalize", "close", "release"]);
    assert_eq!(report.episodes_finalized, 1);
    assert_eq!(files(&supervisor)[0].frames, vec![0, 1, 2]);
}
