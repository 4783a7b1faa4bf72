// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod execute;
pub mod format;
pub mod remote;
pub mod report;
pub mod start;
pub mod status;
pub mod stop;

use std::fmt;

use clap::{Args, Parser, Subcommand};

use crate::{
    action::{ActionOptions, Verb},
    component::ComponentKind,
    config::Config,
    event::{Event, EventSink, LogSink, StdoutSink},
    filesystem::{FileSystem, Report, Selection},
    rc::RcFlags,
    registry,
};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled. Every error handled this way was caused by the operator's input,
/// so `main()` exits with the user error code.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error<T>() -> HandledResult<T> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Administer Lustre filesystems across a cluster", long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable mode: print one JSON event per line on stdout. This is how an operation is
    /// run on a server on behalf of a controller.
    #[arg(short = 'R', long, global = true)]
    pub remote: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start targets, routers and clients, in dependency order.
    Start(OpArgs),
    /// Stop clients, routers and targets, in reverse dependency order.
    Stop(OpArgs),
    /// Format targets. Destroys their contents.
    Format(OpArgs),
    /// Report the state of every component.
    Status(OpArgs),
    /// Run the command given with -o for every selected component, on the server hosting it.
    Execute(OpArgs),
}

impl Commands {
    pub fn verb(&self) -> Verb {
        match self {
            Commands::Start(_) => Verb::Start,
            Commands::Stop(_) => Verb::Stop,
            Commands::Format(_) => Verb::Format,
            Commands::Status(_) => Verb::Status,
            Commands::Execute(_) => Verb::Execute,
        }
    }

    pub fn args(&self) -> &OpArgs {
        match self {
            Commands::Start(args)
            | Commands::Stop(args)
            | Commands::Format(args)
            | Commands::Status(args)
            | Commands::Execute(args) => args,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct OpArgs {
    /// Filesystem to operate on. May be left out if only one is configured.
    #[arg(short = 'f', long = "fsname")]
    pub fs_name: Option<String>,

    /// Only these components, by label (e.g. MGS,testfs-OST0001).
    #[arg(short = 'l', long, value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Only components hosted on these servers.
    #[arg(short = 'n', long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Only components of these kinds (mgt, mdt, ost, router, client).
    #[arg(short = 't', long = "type", value_delimiter = ',')]
    pub kinds: Vec<String>,

    /// Move components onto these failover servers before operating on them.
    #[arg(short = 'F', long, value_delimiter = ',')]
    pub failover: Vec<String>,

    /// Additional options for the command that is run; for execute, the command itself.
    #[arg(short = 'o', long, allow_hyphen_values = true)]
    pub options: Option<String>,

    /// Skip the device and mount data checks.
    #[arg(long)]
    pub nocheck: bool,
}

impl OpArgs {
    fn action_options(&self) -> ActionOptions {
        ActionOptions {
            options: self.options.clone(),
            nocheck: self.nocheck,
        }
    }

    fn selection(&self) -> Result<Selection, crate::config::ConfigError> {
        let kinds = self
            .kinds
            .iter()
            .map(|k| registry::kind(k))
            .collect::<Result<Vec<ComponentKind>, _>>()?;
        Ok(Selection {
            labels: self.labels.clone(),
            nodes: self.nodes.clone(),
            kinds,
        })
    }
}

/// Report an error caused by the operator's input. In remote mode the controller only reads
/// events, so the error is sent as the terminal result.
fn report_error(cli: &Cli, error: &dyn fmt::Display) {
    if cli.remote {
        StdoutSink.emit(&Event::Result {
            rc: RcFlags::USER_ERROR.exit_code(),
            output: Some(error.to_string()),
        });
    } else {
        eprintln!("Error: {error}");
    }
}

fn config_path(cli: &Cli) -> String {
    cli.config.clone().unwrap_or_else(crate::default_config_path)
}

/// Load the configuration and assemble the filesystem selected by `args`.
fn load_filesystem(cli: &Cli, args: &OpArgs) -> HandledResult<FileSystem> {
    let path = config_path(cli);
    let config = Config::load(&path).handle_err(|e| report_error(cli, &e))?;
    FileSystem::new(&config, args.fs_name.as_deref(), Some(&path))
        .handle_err(|e| report_error(cli, &e))
}

/// Everything a command handler needs to run an operation in human mode.
struct Operation {
    fs: FileSystem,
    selection: Selection,
    options: ActionOptions,
}

impl Operation {
    /// Load the filesystem and apply the selection and any failover named by `args`.
    fn prepare(cli: &Cli, args: &OpArgs) -> HandledResult<Self> {
        let fs = load_filesystem(cli, args)?;
        let selection = args.selection().handle_err(|e| report_error(cli, &e))?;

        if !args.failover.is_empty() {
            let moved = fs
                .failover(&args.failover, &selection)
                .handle_err(|e| report_error(cli, &e))?;
            if moved.is_empty() {
                log::warn!("no component can fail over to {}", args.failover.join(","));
            }
        }

        Ok(Operation {
            fs,
            selection,
            options: args.action_options(),
        })
    }

    async fn run(&self, verb: Verb) -> HandledResult<Report> {
        self.fs
            .run(verb, &self.selection, &self.options, &LogSink)
            .await
            .handle_err(|e| eprintln!("Error: {e}"))
    }
}

pub fn main(cli: &Cli) -> HandledResult<RcFlags> {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error launching tokio runtime: {e}");
            return Ok(RcFlags::RUNTIME_ERROR);
        }
    };

    rt.block_on(async {
        let args = cli.command.args();
        if cli.remote {
            return remote::remote(cli, cli.command.verb(), args).await;
        }

        match &cli.command {
            Commands::Start(args) => start::start(cli, args).await,
            Commands::Stop(args) => stop::stop(cli, args).await,
            Commands::Format(args) => format::format(cli, args).await,
            Commands::Status(args) => status::status(cli, args).await,
            Commands::Execute(args) => execute::execute(cli, args).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arguments() {
        let cli = Cli::parse_from([
            "shoal",
            "-R",
            "--config",
            "/tmp/shoal.toml",
            "start",
            "-f",
            "testfs",
            "-l",
            "MGS,testfs-MDT0000",
            "-F",
            "srv2",
            "-o",
            "-o abort_recov",
        ]);
        assert!(cli.remote);
        assert_eq!(cli.config.as_deref(), Some("/tmp/shoal.toml"));
        assert_eq!(cli.command.verb(), Verb::Start);

        let args = cli.command.args();
        assert_eq!(args.fs_name.as_deref(), Some("testfs"));
        assert_eq!(args.labels, vec!["MGS", "testfs-MDT0000"]);
        assert_eq!(args.failover, vec!["srv2"]);
        assert_eq!(args.options.as_deref(), Some("-o abort_recov"));
        assert!(!args.nocheck);
    }

    #[test]
    fn kinds_are_validated() {
        let args = OpArgs {
            kinds: vec!["ost".to_string(), "client".to_string()],
            ..Default::default()
        };
        assert_eq!(
            args.selection().unwrap().kinds,
            vec![ComponentKind::Ost, ComponentKind::Client]
        );

        let args = OpArgs {
            kinds: vec!["disk".to_string()],
            ..Default::default()
        };
        assert!(args.selection().is_err());
    }
}
