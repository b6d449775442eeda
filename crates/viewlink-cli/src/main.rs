use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use viewlink_core::config::{Config, HttpConfig, KernelConfig, LoggingConfig};
use viewlink_core::types::{ActionId, ActionValue, InputEvent, TransportMode, ViewportId};
use viewlink_interactor::{FileSurface, LatestState, Page};
use viewlink_transport::ActionTable;

#[derive(Parser)]
#[command(
    name = "viewlink",
    about = "Drive a renderer viewport over its web server or a notebook kernel",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Renderer web server URL (selects the HTTP transport)
    #[arg(long, global = true, conflicts_with = "kernel")]
    url: Option<String>,

    /// Jupyter server URL (selects the kernel transport)
    #[arg(long, global = true, requires = "kernel_id")]
    kernel: Option<String>,

    /// Kernel id on the Jupyter server
    #[arg(long, global = true)]
    kernel_id: Option<String>,

    /// Viewport to drive
    #[arg(long, global = true)]
    viewport: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the renderer is reachable
    Probe,

    /// Run a renderer command
    Execute {
        command: String,

        /// Fold the command into the frame request
        #[arg(long)]
        immediate: bool,
    },

    /// Set a property on an object
    SetProp {
        object: String,
        property: String,
        value: String,
    },

    /// Trigger a renderer action (kernel transport only)
    Action { id: u32, value: String },

    /// Save the current frame
    Frame {
        /// Output file (default: viewer.output from config, or frame.jpg)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print the viewport state
    State,

    /// Send a key event, e.g. `key=65,modifiers=C`
    Key { spec: String },

    /// Send a mouse event, e.g. `button=0,x=10,y=20`
    Mouse { spec: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        let level = match (verbose, logging.and_then(|l| l.level.as_deref())) {
            (true, _) => "debug",
            (false, Some(level)) => level,
            (false, None) => "info",
        };
        let mut directives = vec![level.to_string()];
        directives.extend(logging.map(|l| l.filters.clone()).unwrap_or_default());
        EnvFilter::try_new(directives.join(","))
    })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.is_some_and(|l| l.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Apply command-line overrides on top of the loaded config.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.url {
        let mut http = config.http.clone().unwrap_or_else(HttpConfig::default);
        http.base_url = url.clone();
        config.http = Some(http);
        config.mode = Some(TransportMode::Http);
    }
    if let (Some(url), Some(kernel_id)) = (&cli.kernel, &cli.kernel_id) {
        let kernel = match config.kernel.take() {
            Some(mut kernel) => {
                kernel.url = url.clone();
                kernel.kernel_id = kernel_id.clone();
                kernel
            }
            None => KernelConfig::new(url.clone(), kernel_id.clone()),
        };
        config.kernel = Some(kernel);
        config.mode = Some(TransportMode::Kernel);
    }
    if let Some(viewport) = cli.viewport {
        let mut viewer = config.viewer.clone().unwrap_or_default();
        viewer.viewport = ViewportId(viewport);
        config.viewer = Some(viewer);
    }
}

/// Reject subcommands the selected transport cannot carry out.
///
/// Over HTTP, actions only reach handlers registered in-process, and the CLI
/// registers none.
fn check_supported(command: &Commands, mode: TransportMode) -> anyhow::Result<()> {
    if let (Commands::Action { .. }, TransportMode::Http) = (command, mode) {
        anyhow::bail!(
            "`action` needs the kernel transport; over HTTP actions are handled by the embedding page"
        );
    }
    Ok(())
}

fn output_path(config: &Config, output: Option<String>) -> String {
    output
        .or_else(|| config.viewer.as_ref().and_then(|v| v.output.clone()))
        .unwrap_or_else(|| "frame.jpg".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    let mut config = Config::load(&config_path)?;
    apply_overrides(&mut config, &cli);

    init_logging(cli.verbose, config.logging.as_ref())?;

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    let output = match &cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
                return Ok(());
            }
        },
        Commands::Frame { output } => output_path(&config, output.clone()),
        _ => output_path(&config, None),
    };

    check_supported(&cli.command, config.mode())?;

    let transport = viewlink_transport::connect(&config, ActionTable::new()).await?;
    if let Commands::Probe = cli.command {
        transport.probe().await?;
        println!("Renderer reachable ({} mode)", transport.mode());
        return Ok(());
    }

    let viewport = config.viewport();
    let fetch_timeout = Duration::from_millis(config.http_or_default().timeout_ms);
    let surface = Arc::new(FileSurface::new(&output, fetch_timeout)?);
    let overlay = Arc::new(LatestState::new());
    let mut page = Page::new(transport);
    page.add_surface(viewport, surface.clone());
    page.set_overlay_factory(overlay.clone());

    let interactor = page.interactor(viewport);
    tracing::debug!(viewport = %viewport, mode = %page.mode(), "Interactor ready");

    match cli.command {
        Commands::Execute { command, immediate } => {
            interactor.execute(&command, immediate);
        }
        Commands::SetProp {
            object,
            property,
            value,
        } => interactor.set_prop(&object, &property, &value),
        Commands::Action { id, value } => {
            interactor.do_action(ActionId(id), ActionValue::Text(value));
        }
        Commands::State => {
            // Let the initial frame and overlay sizing finish so their state
            // query cannot overtake this one.
            page.settle().await;
            let (tx, rx) = oneshot::channel();
            interactor.get_state(move |state| {
                let _ = tx.send(state);
            });
            page.settle().await;
            match rx.await {
                Ok(state) => println!("{state}"),
                Err(_) => anyhow::bail!("no state received from viewport {viewport}"),
            }
            return Ok(());
        }
        Commands::Key { spec } => interactor.send_input(InputEvent::Key(spec)),
        Commands::Mouse { spec } => interactor.send_input(InputEvent::Mouse(spec)),
        Commands::Frame { .. } | Commands::Probe | Commands::Config { .. } => {}
    }

    page.settle().await;
    if surface.frames_written() == 0 {
        anyhow::bail!("no frame was written to {}", surface.path().display());
    }
    tracing::info!(path = %surface.path().display(), frames = surface.frames_written(), "Frame saved");
    if let Some(state) = overlay.get() {
        tracing::debug!(state = %state, "Viewport state");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("viewlink").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_kernel_flags_select_kernel_mode() {
        let cli = parse(&["--kernel", "http://localhost:8888", "--kernel-id", "abc", "state"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.mode(), TransportMode::Kernel);
        let kernel = config.kernel.unwrap();
        assert_eq!(kernel.kernel_id, "abc");
        assert_eq!(kernel.namespace, "lavavu.control");
    }

    #[test]
    fn test_url_and_viewport_override_config() {
        let cli = parse(&["--url", "http://10.0.0.2:9000", "--viewport", "2", "frame"]);
        let mut config = Config::parse(r#"{ mode: "kernel", viewer: { output: "~/out.png" } }"#).unwrap();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.mode(), TransportMode::Http);
        assert_eq!(config.http_or_default().base_url, "http://10.0.0.2:9000");
        assert_eq!(config.viewport(), ViewportId(2));
        assert_eq!(output_path(&config, None), "~/out.png");
        assert_eq!(output_path(&config, Some("a.jpg".into())), "a.jpg");
    }

    #[test]
    fn test_action_needs_kernel_transport() {
        let cli = parse(&["--url", "http://localhost:8080", "action", "3", "points"]);
        let err = check_supported(&cli.command, TransportMode::Http).unwrap_err();
        assert!(err.to_string().contains("kernel transport"));
        assert!(check_supported(&cli.command, TransportMode::Kernel).is_ok());

        let frame = parse(&["frame"]);
        assert!(check_supported(&frame.command, TransportMode::Http).is_ok());
    }

    #[test]
    fn test_kernel_requires_kernel_id() {
        let parsed = Cli::try_parse_from(["viewlink", "--kernel", "http://localhost:8888", "probe"]);
        assert!(parsed.is_err());
    }
}
