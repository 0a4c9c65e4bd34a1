#![cfg(unix)]

use comaster::sim::{SimulatedBus, SimulatedNode};
use comaster::*;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn start_master(name: &str) -> Arc<MasterNode> {
    let bus = SimulatedBus::new("vcan0").unwrap().with_node(SimulatedNode::standard(5));
    let device = DeviceConfig::parse("[1F81sub5]\nDefaultValue=1\n", None).unwrap();
    let mut config = MasterConfig::new(name, "vcan0", 1);
    config.watch_signals = true;
    config.force_policy = ForcePolicy::AbortLoop;
    Arc::new(MasterNode::with_device(&config, &device, &bus).unwrap())
}

fn raise(signal: &str) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -{} {}", signal, std::process::id()))
        .status()
        .unwrap();
    assert!(status.success());
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Blocks the loop thread outright, without yielding to the reactor.
fn block_loop(master: &Arc<MasterNode>, duration: Duration) -> std::thread::JoinHandle<Result<(), BridgeError>> {
    let master = Arc::clone(master);
    let handle = std::thread::spawn(move || {
        master.executor().run_sync(move |_ctx| {
            Box::pin(async move {
                std::thread::sleep(duration);
            })
        })
    });
    std::thread::sleep(Duration::from_millis(100));
    handle
}

// Signals are process-wide, so every scenario runs in this one test.
#[test]
fn test_real_signals_reach_a_blocked_loop() {
    let master = start_master("hangup");
    let worker = block_loop(&master, Duration::from_secs(2));

    raise("HUP");
    assert!(wait_until(Duration::from_secs(1), || master.state() == ShutdownState::Draining));
    raise("INT");
    assert!(wait_until(Duration::from_secs(1), || master.shutdown_controller().is_forced()));

    assert!(master.wait_timeout(Duration::from_secs(5)));
    assert_eq!(master.state(), ShutdownState::Terminated);
    let _ = worker.join().unwrap();

    // idle loop, SIGTERM twice
    let master = start_master("terminate");
    raise("TERM");
    assert!(wait_until(Duration::from_secs(1), || master.state() != ShutdownState::Armed));
    assert!(master.wait_timeout(Duration::from_secs(2)));
    assert!(!master.shutdown_controller().is_forced());

    raise("TERM");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(master.state(), ShutdownState::Terminated);
    assert!(!master.shutdown_controller().is_forced());
}
