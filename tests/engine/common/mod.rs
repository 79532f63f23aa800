pub mod device;

use device::{SimDevice, SimState, StackFrame};
use mfdbg::{Engine, EngineConfig};
use std::time::{Duration, Instant};

/// Packed method index of `App` assembly method `n`.
pub const fn app_method(n: u32) -> u32 {
    (1 << 16) | n
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retries: 1,
        timeout_ms: 200,
        stop_timeout_ms: 1000,
        eval_timeout_ms: 1000,
        ..EngineConfig::default()
    }
}

/// Program with one app-domain, assembly `App` and a single thread stopped two
/// frames deep.
pub fn program() -> SimState {
    let mut state = SimState {
        threads: vec![1],
        assemblies: vec![(1, "App".to_string())],
        app_domains: vec![(1, "default".to_string(), vec![1])],
        ..SimState::default()
    };
    state.stacks.insert(
        1,
        (
            1,
            vec![
                StackFrame {
                    md: app_method(0),
                    ip: 4,
                },
                StackFrame {
                    md: app_method(2),
                    ip: 12,
                },
            ],
        ),
    );
    state
}

/// Start a simulated device and an engine connected to it.
pub fn start(state: SimState, config: EngineConfig) -> (Engine, SimDevice) {
    let (device, host) = SimDevice::start(state);
    let engine = Engine::new(Box::new(host), config);
    engine.start().unwrap();
    (engine, device)
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

#[macro_export]
macro_rules! device_env {
    ($state: expr, $engine: ident, $device: ident, $code: block) => {
        $crate::device_env!($state, $crate::common::test_config(), $engine, $device, $code)
    };
    ($state: expr, $config: expr, $engine: ident, $device: ident, $code: block) => {{
        let ($engine, $device) = $crate::common::start($state, $config);
        $code
        $engine.dispose().unwrap();
        drop($device);
    }};
}
