//! Process surface of the message router and the log collector: command
//! line options, the service state machine and the console loop

use crate::config::{LoggingConfig, RemoteServiceConfig};
use crate::error::{Error, Result};
use crate::logging::{self, LoggingHandle};
use crate::remote::{ConnectedInstance, RemoteServer, ServerPolicy};
use clap::{CommandFactory, FromArgMatches, Parser};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit code when installing the service fails.
pub const EXIT_INSTALL_FAILED: i32 = -2;

/// Command line of a server process. In console mode the same flags are
/// accepted as commands on standard input.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(version, about = "Multitarget message server")]
pub struct ServerOptions {
    /// Run interactively, reading commands from standard input
    #[arg(short = 'c', long)]
    pub console: bool,

    /// Run as a background service until interrupted
    #[arg(short = 's', long)]
    pub service: bool,

    /// Install the process as a system service
    #[arg(short = 'i', long)]
    pub install: bool,

    /// Remove the system service
    #[arg(short = 'u', long)]
    pub uninstall: bool,

    /// Pause accepting connections, or continue when paused
    #[arg(short = 'p', long)]
    pub pause: bool,

    /// Restart the server
    #[arg(short = 'r', long)]
    pub restart: bool,

    /// Stop the server and quit
    #[arg(short = 'q', long)]
    pub quit: bool,

    /// List connected instances
    #[arg(short = 'n', long)]
    pub instances: bool,

    /// Log everything down to debug level
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Switch logging off
    #[arg(short = 't', long)]
    pub silent: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    Install,
    Uninstall,
    Pause,
    Restart,
    Quit,
    Instances,
    Verbose,
    Silent,
}

impl ServerOptions {
    /// Parses the process arguments, naming the program `name` in help and
    /// errors. Exits on invalid arguments.
    pub fn parse_args(name: &'static str) -> Self {
        let matches = Self::command().name(name).get_matches();
        Self::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
    }

    /// Parses one console line such as `-p` or `--instances`.
    pub fn parse_line(name: &str, line: &str) -> Result<Self> {
        let args = std::iter::once(name).chain(line.split_whitespace());
        Self::try_parse_from(args).map_err(|err| Error::configuration(err.to_string(), None))
    }

    pub fn config_path(&self, default: &str) -> PathBuf {
        self.config.clone().unwrap_or_else(|| PathBuf::from(default))
    }

    /// Commands selected by the flags, in execution order.
    pub fn commands(&self) -> Vec<ServerCommand> {
        [
            (self.install, ServerCommand::Install),
            (self.uninstall, ServerCommand::Uninstall),
            (self.verbose, ServerCommand::Verbose),
            (self.silent, ServerCommand::Silent),
            (self.pause, ServerCommand::Pause),
            (self.restart, ServerCommand::Restart),
            (self.instances, ServerCommand::Instances),
            (self.quit, ServerCommand::Quit),
        ]
        .into_iter()
        .filter_map(|(set, command)| set.then_some(command))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    Running,
    PausePending,
    Paused,
    ContinuePending,
    StopPending,
}

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Drives a [`RemoteServer`] through the service states.
pub struct ServiceController<P: ServerPolicy> {
    name: String,
    server: RemoteServer<P>,
    state: watch::Sender<ServiceState>,
    logging: Option<LoggingHandle>,
}

impl<P: ServerPolicy> ServiceController<P> {
    pub fn new(name: impl Into<String>, config: RemoteServiceConfig, policy: P) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            name: name.into(),
            server: RemoteServer::new(config, policy),
            state,
            logging: None,
        }
    }

    pub fn with_logging(mut self, logging: LoggingHandle) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &RemoteServer<P> {
        &self.server
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(service = %self.name, from = ?previous, to = ?state, "Service state changed");
        }
    }

    fn expect_state(&self, allowed: &[ServiceState], operation: &str) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::invalid_state(&self.name, state, operation))
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.expect_state(&[ServiceState::Stopped], "start")?;
        self.set_state(ServiceState::StartPending);
        match self.server.start().await {
            Ok(address) => {
                info!(service = %self.name, %address, "Listening");
                self.set_state(ServiceState::Running);
                Ok(())
            }
            Err(err) => {
                self.set_state(ServiceState::Stopped);
                Err(err)
            }
        }
    }

    pub async fn stop(&self) {
        if self.state() == ServiceState::Stopped {
            return;
        }
        self.set_state(ServiceState::StopPending);
        self.server.stop().await;
        self.set_state(ServiceState::Stopped);
    }

    pub fn pause(&self) -> Result<()> {
        self.expect_state(&[ServiceState::Running], "pause")?;
        self.set_state(ServiceState::PausePending);
        self.server.pause();
        self.set_state(ServiceState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.expect_state(&[ServiceState::Paused], "continue")?;
        self.set_state(ServiceState::ContinuePending);
        self.server.resume();
        self.set_state(ServiceState::Running);
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.expect_state(&[ServiceState::Running, ServiceState::Paused], "restart")?;
        self.stop().await;
        self.start().await
    }

    pub fn instances(&self) -> Vec<ConnectedInstance> {
        self.server.core().instances()
    }

    fn set_log_level(&self, level: &str) -> Result<()> {
        match &self.logging {
            Some(logging) => logging.set_level(level),
            None => {
                warn!(service = %self.name, level, "Logging is not installed");
                Ok(())
            }
        }
    }

    pub async fn execute(&self, command: ServerCommand) -> Result<Flow> {
        match command {
            ServerCommand::Install => install(&self.name)?,
            ServerCommand::Uninstall => uninstall(&self.name),
            ServerCommand::Pause => {
                if self.state() == ServiceState::Paused {
                    self.resume()?;
                } else {
                    self.pause()?;
                }
            }
            ServerCommand::Restart => self.restart().await?,
            ServerCommand::Instances => {
                let instances = self.instances();
                println!("{} connected instance(s)", instances.len());
                for instance in instances {
                    println!(
                        "  {:>6}  {:<24} {:?} {:?} pid {}",
                        instance.cookie,
                        instance.info.name,
                        instance.info.source,
                        instance.info.bitness,
                        instance.info.process_id
                    );
                }
            }
            ServerCommand::Verbose => self.set_log_level(logging::VERBOSE_LEVEL)?,
            ServerCommand::Silent => self.set_log_level(logging::SILENT_LEVEL)?,
            ServerCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Executes commands read line by line until `--quit` or end of input.
    pub async fn run_console<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let options = match ServerOptions::parse_line(&self.name, &line) {
                Ok(options) => options,
                Err(err) => {
                    println!("{err}");
                    continue;
                }
            };
            for command in options.commands() {
                match self.execute(command).await {
                    Ok(Flow::Quit) => return Ok(()),
                    Ok(Flow::Continue) => {}
                    Err(err) => println!("{err}"),
                }
            }
        }
        Ok(())
    }
}

/// Registers the process as a system service. Nothing to do on POSIX
/// systems, where the process is started by the init system.
pub fn install(name: &str) -> Result<()> {
    if cfg!(unix) {
        info!(service = name, "Service installation is not required on this platform");
        Ok(())
    } else {
        Err(Error::runtime_msg(format!(
            "Installing '{name}' as a system service is not supported"
        )))
    }
}

pub fn uninstall(name: &str) {
    info!(service = name, "Service uninstalled");
}

/// Runs a server process with the given options and returns its exit code.
pub async fn run_server<P: ServerPolicy>(
    name: &str,
    options: ServerOptions,
    config: RemoteServiceConfig,
    logging: &LoggingConfig,
    policy: P,
) -> i32 {
    if options.install {
        return match install(name) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("{name}: {err}");
                EXIT_INSTALL_FAILED
            }
        };
    }
    if options.uninstall {
        uninstall(name);
        return 0;
    }

    let mut controller = ServiceController::new(name, config, policy);
    let level = if options.silent {
        logging::SILENT_LEVEL.to_string()
    } else if options.verbose {
        logging::VERBOSE_LEVEL.to_string()
    } else {
        logging.level.clone()
    };
    if logging.enabled {
        match logging::init(&logging.clone().with_level(level)) {
            Ok(handle) => controller = controller.with_logging(handle),
            Err(err) => eprintln!("{name}: {err}"),
        }
    }

    if let Err(err) = controller.start().await {
        error!(service = name, error = %err, "Failed to start");
        return 1;
    }

    if options.console {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::select! {
            result = controller.run_console(stdin) => {
                if let Err(err) = result {
                    error!(service = name, error = %err, "Console failed");
                }
            }
            _ = tokio::signal::ctrl_c() => info!(service = name, "Interrupted"),
        }
    } else if let Err(err) = tokio::signal::ctrl_c().await {
        error!(service = name, error = %err, "Failed to wait for Ctrl-C");
    }

    controller.stop().await;
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{
        InstanceInfo, MessageBody, MessageId, MessageSource, RemoteMessage, ServiceRouter,
        TcpTransport, Transport, COOKIE_ROUTER, COOKIE_UNKNOWN,
    };

    fn local_config() -> RemoteServiceConfig {
        RemoteServiceConfig::router().with_host("127.0.0.1").with_port(0)
    }

    #[test]
    fn test_flags_map_to_commands() {
        let options = ServerOptions::try_parse_from(["mtrouter", "-c", "-v", "-n", "--config", "a.toml"]).unwrap();
        assert!(options.console);
        assert_eq!(options.config_path("default"), PathBuf::from("a.toml"));
        assert_eq!(
            options.commands(),
            vec![ServerCommand::Verbose, ServerCommand::Instances]
        );

        let options = ServerOptions::parse_line("mtrouter", "--quit -p").unwrap();
        assert_eq!(options.commands(), vec![ServerCommand::Pause, ServerCommand::Quit]);
        assert_eq!(
            ServerOptions::default().config_path("./config/router.init"),
            PathBuf::from("./config/router.init")
        );
        assert!(ServerOptions::parse_line("mtrouter", "--bogus").is_err());
    }

    #[tokio::test]
    async fn test_state_machine() {
        let controller = ServiceController::new("unit", local_config(), ServiceRouter::new());
        assert_eq!(controller.state(), ServiceState::Stopped);
        assert!(controller.pause().is_err());

        controller.start().await.unwrap();
        assert_eq!(controller.state(), ServiceState::Running);
        assert!(controller.start().await.is_err());

        assert_eq!(controller.execute(ServerCommand::Pause).await.unwrap(), Flow::Continue);
        assert_eq!(controller.state(), ServiceState::Paused);
        assert!(controller.server().is_paused());
        controller.execute(ServerCommand::Pause).await.unwrap();
        assert_eq!(controller.state(), ServiceState::Running);

        controller.restart().await.unwrap();
        assert_eq!(controller.state(), ServiceState::Running);
        assert_eq!(controller.execute(ServerCommand::Quit).await.unwrap(), Flow::Quit);

        controller.stop().await;
        assert_eq!(controller.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_console_lists_instances_and_quits() {
        let controller = ServiceController::new("unit", local_config(), ServiceRouter::new());
        controller.start().await.unwrap();
        let address = controller.server().local_addr().unwrap();

        let peer = TcpTransport::connect(&address.to_string(), 1 << 20).await.unwrap();
        peer.send(RemoteMessage::new(
            COOKIE_UNKNOWN,
            COOKIE_ROUTER,
            MessageBody::HelloServer {
                instance: InstanceInfo::current("console-peer", MessageSource::Client),
            },
        ))
        .await
        .unwrap();
        assert_eq!(peer.recv().await.unwrap().id(), MessageId::AcceptClient);
        assert_eq!(controller.instances().len(), 1);

        let input: &[u8] = b"-n\n\n--nonsense\n-p\n-q\n-r\n";
        controller.run_console(input).await.unwrap();
        // the restart after quit is never executed
        assert_eq!(controller.state(), ServiceState::Paused);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_install_on_posix_succeeds() {
        let options = ServerOptions {
            install: true,
            ..Default::default()
        };
        let code = run_server(
            "unit",
            options,
            local_config(),
            &LoggingConfig::default(),
            ServiceRouter::new(),
        )
        .await;
        if cfg!(unix) {
            assert_eq!(code, 0);
        } else {
            assert_eq!(code, EXIT_INSTALL_FAILED);
        }
    }
}
