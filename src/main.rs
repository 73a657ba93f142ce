use std::process;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use mole::agent::{Agent, AgentError, AgentOptions, StatusServer};
use mole::config::{AppConfig, ConfigSource, RuntimeRole};
use mole::logging::{LogLevel, Logger};
use mole::master::{CallbackResult, Master, MasterOptions};
use mole::muxer::{MuxerConfig, Protocol, TcpMuxer};
use mole::shutdown::ShutdownHooks;
use mole::storage::StorageFacade;
use mole::utils::runtime::ensure_posix_or_exit;
use mole::utils::startup_banner::print_startup_banner;
use serde_json::json;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    ensure_posix_or_exit();

    let (app_config, source) = load_config_or_exit();
    let role = app_config.role().unwrap_or_else(|error| {
        eprintln!("config error: {error}");
        process::exit(2);
    });
    print_startup_banner(role);

    let logger_config = app_config.logger_config().unwrap_or_else(|error| {
        eprintln!("config error: {error}");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({
            "source": source.to_string(),
            "built_in": source == ConfigSource::BuiltIn,
            "role": role.as_str(),
        })),
    );

    let hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install signal hooks: {error}");
        process::exit(2);
    });

    let exit_code = match role {
        RuntimeRole::Master => run_master(&app_config, &logger, &hooks),
        RuntimeRole::Agent => run_agent(&app_config, &logger, &hooks),
    };
    process::exit(exit_code);
}

fn load_config_or_exit() -> (AppConfig, ConfigSource) {
    AppConfig::load_with_discovery(std::env::args().skip(1)).unwrap_or_else(|error| {
        eprintln!("config error: {error}");
        process::exit(2);
    })
}

fn run_master(app_config: &AppConfig, logger: &Arc<Logger>, hooks: &ShutdownHooks) -> i32 {
    let muxer_config = MuxerConfig::from(&app_config.master);
    let muxer = match TcpMuxer::bind(&muxer_config, Arc::clone(logger)) {
        Ok(muxer) => Arc::new(muxer),
        Err(error) => {
            eprintln!("muxer startup error: {error}");
            return 2;
        }
    };

    // The binary attaches no HTTP server; embedders take these channels
    // through `TcpMuxer::listener`.
    for protocol in [Protocol::Http, Protocol::Tls] {
        if muxer.is_serving(protocol) {
            logger.log(
                LogLevel::Warn,
                Some("main::master"),
                "No server attached to channel; rejecting its connections",
                Some(json!({ "protocol": protocol.as_str() })),
            );
            muxer.set_serving(protocol, false);
        }
    }

    let master = Master::builder(MasterOptions::from(&app_config.cluster), Arc::clone(logger))
        .on_join({
            let logger = Arc::clone(logger);
            move |agent_id: &str, first_join: bool| -> CallbackResult {
                logger.log(
                    LogLevel::Info,
                    Some("main::master"),
                    "Agent registered",
                    Some(json!({ "agent_id": agent_id, "first_join": first_join })),
                );
                Ok(())
            }
        })
        .on_die({
            let logger = Arc::clone(logger);
            move |agent_id: &str| -> CallbackResult {
                logger.log(
                    LogLevel::Warn,
                    Some("main::master"),
                    "Agent gone",
                    Some(json!({ "agent_id": agent_id })),
                );
                Ok(())
            }
        })
        .build();

    let muxer_worker = {
        let muxer = Arc::clone(&muxer);
        thread::spawn(move || muxer.serve())
    };
    let master_worker = {
        let master = master.clone();
        let listener = muxer.listener(Protocol::Cluster);
        thread::spawn(move || master.serve(&listener))
    };

    loop {
        if hooks.wait_timeout(STATUS_LOG_INTERVAL, SHUTDOWN_POLL_INTERVAL) {
            break;
        }
        if muxer_worker.is_finished() {
            break;
        }
        logger.log(
            LogLevel::Info,
            Some("main::status"),
            "Cluster status",
            Some(json!({
                "master": master.status(),
                "muxer": muxer.stats(),
            })),
        );
    }

    logger.info(Some("main::master"), "Stopping master");
    muxer.close();

    let mut exit_code = 0;
    match muxer_worker.join() {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            logger.error(Some("main::master"), &format!("muxer stopped: {error}"));
            exit_code = 1;
        }
        Err(_) => {
            logger.error(Some("main::master"), "muxer thread panicked");
            exit_code = 1;
        }
    }
    if master_worker.join().is_err() {
        logger.error(Some("main::master"), "master accept thread panicked");
        exit_code = 1;
    }
    exit_code
}

fn run_agent(app_config: &AppConfig, logger: &Arc<Logger>, hooks: &ShutdownHooks) -> i32 {
    let storage = match StorageFacade::initialize(&app_config.storage, logger) {
        Ok(storage) => Arc::new(storage),
        Err(error) => {
            eprintln!("storage initialization error: {error}");
            return 2;
        }
    };

    if app_config.agent.clear_shutdown {
        match storage.clear_shutdown_marker() {
            Ok(cleared) => logger.log(
                LogLevel::Info,
                Some("main::agent"),
                "Shutdown marker clear requested",
                Some(json!({ "cleared": cleared })),
            ),
            Err(error) => {
                eprintln!("failed to clear shutdown marker: {error}");
                return 2;
            }
        }
    }

    let agent_id = match storage.resolve_agent_id(&app_config.agent.id) {
        Ok(agent_id) => agent_id,
        Err(error) => {
            eprintln!("failed to resolve agent id: {error}");
            return 2;
        }
    };

    let mut agent = Agent::new(
        AgentOptions::from_config(app_config, agent_id),
        Arc::clone(&storage),
        Arc::clone(logger),
    );
    let listener = agent.listener();
    let status_worker =
        StatusServer::new(agent.handle(), Arc::clone(logger)).spawn(Arc::clone(&listener));

    // Signals end the serve loop through a clean `leave`.
    {
        let flag = hooks.flag();
        let handle = agent.handle();
        thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(SHUTDOWN_POLL_INTERVAL);
            }
            let _ = handle.leave();
        });
    }

    let mut backoff = JoinBackoff::new(
        Duration::from_millis(app_config.agent.backoff_min_ms),
        Duration::from_millis(app_config.agent.backoff_max_ms),
    );
    let exit_code = loop {
        if hooks.is_triggered() {
            break 0;
        }

        let outcome = agent.join().and_then(|()| {
            backoff.reset();
            if hooks.is_triggered() {
                let _ = agent.handle().leave();
            }
            agent.serve_protocol()
        });

        let error = match outcome {
            Ok(()) => break 0,
            Err(AgentError::ShutdownRequested) => {
                logger.warn(
                    Some("main::agent"),
                    "Master ordered a permanent shutdown; restart with --agent.clear_shutdown true to rejoin",
                );
                break 0;
            }
            Err(error @ AgentError::PermanentlyShutDown { .. }) => {
                logger.error(
                    Some("main::agent"),
                    &format!("{error}; restart with --agent.clear_shutdown true to rejoin"),
                );
                break 3;
            }
            Err(_) if hooks.is_triggered() => break 0,
            Err(error) => error,
        };

        let delay = backoff.next_delay();
        logger.log(
            LogLevel::Warn,
            Some("main::agent"),
            "Agent disconnected; retrying",
            Some(json!({
                "error": error.to_string(),
                "retry_in_ms": delay.as_millis() as u64,
            })),
        );
        if hooks.wait_timeout(delay, SHUTDOWN_POLL_INTERVAL) {
            break 0;
        }
    };

    listener.close();
    let _ = status_worker.join();
    if let Err(error) = storage.flush() {
        logger.error(Some("main::agent"), &format!("storage flush failed: {error}"));
    }
    logger.info(Some("main::agent"), "Agent stopped");
    exit_code
}

// Starts at `min`, doubles per failure up to `max`, resets after a successful join.
#[derive(Debug)]
struct JoinBackoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl JoinBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}
