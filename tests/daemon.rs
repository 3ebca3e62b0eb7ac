//! Integration tests for the daemon: an in-process instance over the
//! in-memory store, running real `sh` subprocesses under a tempdir root.
//!
//! The dispatcher is driven one tick at a time with `dispatch_once` so the
//! scenarios are deterministic; completions are observed by polling the
//! store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use pybs::capacity::CapacityMode;
use pybs::client::RpcClient;
use pybs::config::Settings;
use pybs::daemon::{Daemon, force_start};
use pybs::dispatcher::dispatch_once;
use pybs::error::PybsError;
use pybs::jobstore::{JobState, JobStore};
use pybs::notify::Notifier;
use pybs::rpc::{self, RpcServer};
use pybs::store_memory::MemoryStore;

/// One daemon with its own tempdir root and an in-memory store.
struct TestHarness {
    daemon: Arc<Daemon>,
    store: Arc<MemoryStore>,
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl TestHarness {
    fn new(node: &str, ncpus: i64) -> Self {
        Self::with_notifiers(node, ncpus, CapacityMode::Query, HashMap::new())
    }

    fn with_mode(node: &str, ncpus: i64, mode: CapacityMode) -> Self {
        Self::with_notifiers(node, ncpus, mode, HashMap::new())
    }

    fn with_notifiers(
        node: &str,
        ncpus: i64,
        mode: CapacityMode,
        notifiers: HashMap<String, Arc<dyn Notifier>>,
    ) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let root = tmp.path().to_path_buf();
        let store = Arc::new(MemoryStore::new());
        let daemon = Arc::new(Daemon::new(
            &settings(&root, node, ncpus, mode),
            store.clone(),
            notifiers,
        ));
        TestHarness {
            daemon,
            store,
            _tmp: tmp,
            root,
        }
    }

    /// A second daemon on another node sharing this harness's store and root.
    fn peer(&self, node: &str, ncpus: i64) -> Arc<Daemon> {
        Arc::new(Daemon::new(
            &settings(&self.root, node, ncpus, CapacityMode::Query),
            self.store.clone(),
            HashMap::new(),
        ))
    }

    fn script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, contents).expect("write script");
        path
    }

    async fn submit(&self, path: &Path) -> i64 {
        self.daemon
            .submit(path.to_str().expect("utf-8 path"), "tester")
            .await
            .expect("submit accepted")
    }
}

fn settings(root: &Path, node: &str, ncpus: i64, mode: CapacityMode) -> Settings {
    Settings {
        node: Some(node.to_string()),
        ncpus,
        root: root.to_path_buf(),
        database: "memory".to_string(),
        port: 0,
        capacity_mode: mode,
        warmup_secs: 0,
        tick_secs: 1,
    }
}

const WAIT_LIMIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

async fn wait_state(store: &MemoryStore, id: i64, state: JobState) -> pybs::jobstore::Job {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(job) = store.get(id).await.expect("store get")
            && job.state() == state
        {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} did not reach {state:?} in time"
        );
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_drained(daemon: &Daemon) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while daemon.active_jobs() > 0 {
        assert!(Instant::now() < deadline, "supervisors did not drain");
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_registered(daemon: &Daemon, id: i64) -> u32 {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(pid) = daemon.process_pid(id) {
            return pid;
        }
        assert!(Instant::now() < deadline, "job {id} never registered a pid");
        tokio::time::sleep(POLL).await;
    }
}

// ---------- Scenarios ----------

#[tokio::test]
async fn happy_path_runs_a_submitted_script() {
    let h = TestHarness::new("n1", 2);
    let script = h.script(
        "t.sh",
        "#!/bin/sh\n#PBS -N t\n#PBS -l ncpus=1\n#PBS -o t.output\necho ok\n",
    );

    let id = h.submit(&script).await;
    let waiting = h.daemon.list_waiting().await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].name, "t");

    assert!(dispatch_once(&h.daemon).await.unwrap());
    let job = wait_state(&h.store, id, JobState::Finished).await;
    wait_drained(&h.daemon).await;

    // Monotone timestamps: submitted ≤ started ≤ finished.
    let started = job.started.unwrap();
    let finished = job.finished.unwrap();
    assert!(job.submitted <= started);
    assert!(started <= finished);
    assert_eq!(job.node.as_deref(), Some("n1"));

    let done = h.daemon.list_finished(5).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].name, "t");
    assert_eq!(done[0].ncpus, 1);

    // The capture landed next to the script.
    let captured = std::fs::read_to_string(h.root.join("t.output")).unwrap();
    assert_eq!(captured, "ok\n");
}

#[tokio::test]
async fn affinity_restricts_which_node_claims() {
    let h = TestHarness::new("n1", 4);
    let d2 = h.peer("n2", 4);

    let pinned = h.script(
        "pinned.sh",
        "#PBS -N pinned\n#PBS -l ncpus=1\n#PBS -l nodes=n2\necho ok\n",
    );
    let prefix = h.script(
        "prefix.sh",
        "#PBS -N prefix\n#PBS -l ncpus=1\n#PBS -l nodes=n10\necho ok\n",
    );
    let pinned_id = h.submit(&pinned).await;
    h.submit(&prefix).await;

    // n1 sees nothing: one job pinned to n2, the other to n10 (and `n1`
    // must not substring-match `n10`).
    assert!(!dispatch_once(&h.daemon).await.unwrap());

    // n2 claims the pinned job, and only that one.
    assert!(dispatch_once(&d2).await.unwrap());
    let job = wait_state(&h.store, pinned_id, JobState::Finished).await;
    assert_eq!(job.node.as_deref(), Some("n2"));
    assert!(!dispatch_once(&d2).await.unwrap());
    wait_drained(&d2).await;
}

#[tokio::test]
async fn capacity_bounds_concurrent_jobs() {
    let h = TestHarness::new("n1", 4);
    for name in ["one", "two"] {
        let script = h.script(
            &format!("{name}.sh"),
            &format!("#PBS -N {name}\n#PBS -l ncpus=3\nsleep 0.3\necho done\n"),
        );
        h.submit(&script).await;
    }

    // 3 of 4 CPUs go to the first job; the second does not fit.
    assert!(dispatch_once(&h.daemon).await.unwrap());
    assert!(!dispatch_once(&h.daemon).await.unwrap());
    assert_eq!(h.daemon.list_running().await.unwrap().len(), 1);

    let first = h.daemon.list_running().await.unwrap()[0].id;
    wait_state(&h.store, first, JobState::Finished).await;

    // Capacity came back; the second job can start now.
    assert!(dispatch_once(&h.daemon).await.unwrap());
    assert_eq!(h.daemon.list_running().await.unwrap().len(), 1);
    let second = h.daemon.list_running().await.unwrap()[0].id;
    wait_state(&h.store, second, JobState::Finished).await;
    wait_drained(&h.daemon).await;
}

#[tokio::test]
async fn counter_mode_charges_and_restores() {
    let h = TestHarness::with_mode("n1", 2, CapacityMode::Counter);
    let script = h.script("c.sh", "#PBS -N c\n#PBS -l ncpus=2\nsleep 0.2\n");
    let id = h.submit(&script).await;

    assert_eq!(h.daemon.get_cpus().await.unwrap(), (0, 2));
    assert!(dispatch_once(&h.daemon).await.unwrap());
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (2, 2));
    assert!(!dispatch_once(&h.daemon).await.unwrap());

    wait_state(&h.store, id, JobState::Finished).await;
    wait_drained(&h.daemon).await;
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (0, 2));
}

#[tokio::test]
async fn remove_kills_a_running_job() {
    let h = TestHarness::new("n1", 4);
    // Redirect the sleep's streams so only the shell holds the capture
    // pipes; killing it closes them and the supervisor sees EOF at once.
    let script = h.script(
        "long.sh",
        "#PBS -N long\n#PBS -l ncpus=2\nsleep 30 > /dev/null 2>&1\n",
    );
    let id = h.submit(&script).await;

    assert!(dispatch_once(&h.daemon).await.unwrap());
    wait_state(&h.store, id, JobState::Running).await;
    wait_registered(&h.daemon, id).await;

    h.daemon.remove(id).await.unwrap();

    // Row gone, capacity restored, no longer listed.
    assert!(h.store.get(id).await.unwrap().is_none());
    assert!(h.daemon.list_running().await.unwrap().is_empty());
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (0, 4));

    // The supervisor observes the kill promptly — far sooner than the
    // 30 s the script would have slept.
    wait_drained(&h.daemon).await;

    // Removing again reports NotFound.
    match h.daemon.remove(id).await {
        Err(PybsError::NotFound(missing)) => assert_eq!(missing, id),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn remove_from_another_node_restores_counter_capacity() {
    let h = TestHarness::with_mode("n1", 2, CapacityMode::Counter);
    let script = h.script("r.sh", "#PBS -N r\n#PBS -l ncpus=2\nsleep 0.5\n");
    let id = h.submit(&script).await;

    assert!(dispatch_once(&h.daemon).await.unwrap());
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (2, 2));
    wait_state(&h.store, id, JobState::Running).await;

    // The row is shared cluster-wide, so an operator may remove it through
    // a daemon on a different node; that daemon deletes the row but cannot
    // kill or account for a child it does not own.
    let d2 = h.peer("n2", 2);
    d2.remove(id).await.unwrap();
    assert!(h.store.get(id).await.unwrap().is_none());

    // The owning supervisor finds the row gone on exit and returns the
    // claim's charge itself.
    wait_drained(&h.daemon).await;
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (0, 2));
}

#[tokio::test]
async fn concurrent_claims_start_a_job_once() {
    let h = TestHarness::new("n1", 4);
    let d2 = h.peer("n2", 4);

    let script = h.script("solo.sh", "#PBS -N solo\n#PBS -l ncpus=1\necho ok\n");
    let id = h.submit(&script).await;

    let (a, b) = tokio::join!(dispatch_once(&h.daemon), dispatch_once(&d2));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a ^ b, "exactly one daemon must win the claim");

    let job = wait_state(&h.store, id, JobState::Finished).await;
    let winner = if a { "n1" } else { "n2" };
    assert_eq!(job.node.as_deref(), Some(winner));
    wait_drained(&h.daemon).await;
    wait_drained(&d2).await;
}

#[tokio::test]
async fn forced_start_ignores_capacity() {
    let h = TestHarness::new("n1", 1);
    let script = h.script("big.sh", "#PBS -N big\n#PBS -l ncpus=4\necho ok\n");
    let id = h.submit(&script).await;

    // Too big for the node, so the dispatcher skips it...
    assert!(!dispatch_once(&h.daemon).await.unwrap());

    // ...but the operator override starts it anyway.
    force_start(&h.daemon, id).await.unwrap();
    wait_state(&h.store, id, JobState::Finished).await;
    wait_drained(&h.daemon).await;

    // A second forced start is rejected, as is an unknown id.
    assert!(matches!(
        force_start(&h.daemon, id).await,
        Err(PybsError::Validation(_))
    ));
    assert!(matches!(
        force_start(&h.daemon, 999).await,
        Err(PybsError::NotFound(999))
    ));
}

// ---------- Notifications ----------

#[derive(Default)]
struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), PybsError> {
        self.sent.lock().unwrap().push((
            recipient.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

#[tokio::test]
async fn completion_notification_follows_the_mail_mode() {
    let recorder = Arc::new(RecordingNotifier::default());
    let mut notifiers: HashMap<String, Arc<dyn Notifier>> = HashMap::new();
    notifiers.insert("email".to_string(), recorder.clone());
    let h = TestHarness::with_notifiers("n1", 4, CapacityMode::Query, notifiers);

    // Mode `e`: notify on success.
    let ok = h.script(
        "ok.sh",
        "#PBS -N ok\n#PBS -l ncpus=1\n#PBS -m e\n#PBS -M ops@example.org\necho all good\n",
    );
    let ok_id = h.submit(&ok).await;

    // Mode `e` with a failing script: no notification.
    let quiet = h.script(
        "quiet.sh",
        "#PBS -N quiet\n#PBS -l ncpus=1\n#PBS -m e\n#PBS -M ops@example.org\nexit 3\n",
    );
    h.submit(&quiet).await;

    while dispatch_once(&h.daemon).await.unwrap() {}
    wait_state(&h.store, ok_id, JobState::Finished).await;
    wait_drained(&h.daemon).await;

    let sent = recorder.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (recipient, subject, body) = &sent[0];
    assert_eq!(recipient, "ops@example.org");
    assert_eq!(subject, &format!("PyBS JOB {ok_id} ok finished"));
    assert!(body.contains("all good"), "{body}");
    assert!(body.contains("Exit code:  0"), "{body}");
}

#[tokio::test]
async fn missing_transport_is_a_silent_no_op() {
    // `-m a` asks for failure mail, but no notifier is configured; the job
    // must still finish cleanly.
    let h = TestHarness::new("n1", 4);
    let script = h.script(
        "f.sh",
        "#PBS -N f\n#PBS -l ncpus=1\n#PBS -m a\n#PBS -M ops@example.org\nexit 1\n",
    );
    let id = h.submit(&script).await;

    assert!(dispatch_once(&h.daemon).await.unwrap());
    wait_state(&h.store, id, JobState::Finished).await;
    wait_drained(&h.daemon).await;
}

// ---------- RPC ----------

#[tokio::test]
async fn rpc_envelopes_echo_the_request_id() {
    let h = TestHarness::new("n1", 2);

    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"get_cpus","params":{},"id":7}"#,
    )
    .await;
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"], json!([0, 2]));

    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"frobnicate","params":{},"id":8}"#,
    )
    .await;
    assert_eq!(reply["id"], 8);
    assert_eq!(reply["error"]["code"], -32601);

    // Handler failures surface as -32603 with the reason in the message.
    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"remove","params":{"job_id":42},"id":9}"#,
    )
    .await;
    assert_eq!(reply["error"]["code"], -32603);
    assert!(
        reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not found")
    );

    let reply = rpc::process(&h.daemon, "this is not json").await;
    assert_eq!(reply["error"]["code"], -32603);
}

#[tokio::test]
async fn rpc_config_round_trip() {
    let h = TestHarness::new("n1", 2);

    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"setconfig","params":{"key":"ncpus","value":8},"id":1}"#,
    )
    .await;
    assert_eq!(reply["result"]["success"], true);

    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"config","params":{},"id":2}"#,
    )
    .await;
    assert_eq!(reply["result"]["ncpus"], 8);
    assert_eq!(reply["result"]["node"], "n1");

    let reply = rpc::process(
        &h.daemon,
        r#"{"jsonrpc":"2.0","method":"setconfig","params":{"key":"root","value":"/x"},"id":3}"#,
    )
    .await;
    assert_eq!(reply["error"]["code"], -32603);
}

#[tokio::test]
async fn rpc_works_over_a_real_socket() {
    let h = TestHarness::new("n1", 2);

    let server = RpcServer::bind(0).await.expect("bind loopback");
    let port = server.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let serve = tokio::spawn(server.serve(h.daemon.clone(), cancel.clone()));

    let script = h.script("w.sh", "#PBS -N w\n#PBS -l ncpus=1\necho ok\n");
    let mut client = RpcClient::new(port);

    let result = client
        .call(
            "submit",
            json!({ "filename": script.to_str().unwrap(), "user": "tester" }),
        )
        .await
        .expect("submit over rpc");
    let id = result["id"].as_i64().expect("job id");

    let waiting = client.call("list_waiting", json!({})).await.unwrap();
    assert_eq!(waiting.as_array().unwrap().len(), 1);
    assert_eq!(waiting[0]["id"].as_i64(), Some(id));
    assert_eq!(waiting[0]["name"], "w");

    client
        .call("remove", json!({ "job_id": id }))
        .await
        .expect("remove over rpc");
    let waiting = client.call("list_waiting", json!({})).await.unwrap();
    assert!(waiting.as_array().unwrap().is_empty());

    // A daemon-side error comes back as a client error with the message.
    let err = client
        .call("remove", json!({ "job_id": id }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    cancel.cancel();
    let _ = serve.await;
}

// ---------- Submission edge cases ----------

#[tokio::test]
async fn submit_rejects_incomplete_headers() {
    let h = TestHarness::new("n1", 2);

    let err = h.daemon.submit("/nonexistent/script.sh", "tester").await;
    assert!(matches!(err, Err(PybsError::Validation(_))));

    let no_name = h.script("x.sh", "#PBS -l ncpus=1\necho hi\n");
    let err = h
        .daemon
        .submit(no_name.to_str().unwrap(), "tester")
        .await;
    assert!(matches!(err, Err(PybsError::Validation(_))));
}

#[tokio::test]
async fn startup_reconciles_orphaned_rows() {
    let h = TestHarness::new("n1", 4);
    let script = h.script("o.sh", "#PBS -N o\n#PBS -l ncpus=2\necho hi\n");
    let id = h.submit(&script).await;

    // Simulate a row left RUNNING by a crashed daemon on this node.
    h.store.claim_next("n1", 4).await.unwrap().unwrap();
    h.daemon.start().await.unwrap();

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(h.daemon.get_cpus().await.unwrap(), (0, 4));
}
