use clap::Parser;
use color_eyre::Result;
use dbv::render::RenderOptions;
use dbv::{
    App, AppConfig, AppEvent, Dataset, LazyTable, SortDirection, ViewController, ViewEvent,
    WindowCache, WorkerPool, APP_NAME,
};
use ratatui::DefaultTerminal;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about = "dbv - paginated viewer for columnar datasets")]
struct Args {
    /// Parquet/IPC file or directory of Parquet files
    path: PathBuf,

    /// Apply a filter predicate on startup, e.g. "price > 100 and region == 'EU'"
    #[arg(long = "filter")]
    filter: Option<String>,

    /// Sort by this column on startup
    #[arg(long = "sort-key")]
    sort_key: Option<String>,

    /// Sort descending instead of ascending
    #[arg(long = "descending", action)]
    descending: bool,

    /// Show only these columns (comma separated)
    #[arg(long = "columns", value_delimiter = ',')]
    columns: Option<Vec<String>>,

    /// Window cache budget in rows
    #[arg(long = "row-budget")]
    row_budget: Option<usize>,

    /// Initial read-ahead batch for filtered scans, in partitions
    #[arg(long = "read-ahead")]
    read_ahead: Option<usize>,

    /// Worker threads serving window requests
    #[arg(long = "workers")]
    workers: Option<usize>,

    /// Transient read failures tolerated per partition
    #[arg(long = "retries")]
    retries: Option<usize>,

    /// Show origin row numbers as a leading column
    #[arg(long = "row-numbers", action)]
    row_numbers: bool,

    /// Write debug logs to dbv.log in the working directory
    #[arg(long = "debug", action)]
    debug: bool,
}

/// Command line flags win over the config file, which wins over defaults.
fn effective_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::load(APP_NAME)?;
    if let Some(row_budget) = args.row_budget {
        config.engine.row_budget = row_budget;
    }
    if let Some(read_ahead) = args.read_ahead {
        config.engine.read_ahead_partitions = read_ahead;
    }
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if let Some(retries) = args.retries {
        config.engine.read_retries = retries;
    }
    if args.row_numbers {
        config.display.row_numbers = true;
    }
    if args.debug {
        config.debug.enabled = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing() -> Result<()> {
    let file = std::fs::File::create("dbv.log")?;
    tracing_subscriber::fmt()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .init();
    Ok(())
}

fn build_app(args: &Args, config: &AppConfig) -> Result<App> {
    let dataset = Arc::new(Dataset::open(&args.path, config.engine.read_retries as u32)?);
    let frame = Arc::new(LazyTable::new(
        Arc::clone(&dataset),
        config.engine.read_ahead_partitions,
    ));
    let cache = Arc::new(WindowCache::new(config.engine.row_budget));
    let workers = match config.engine.workers {
        0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2),
        n => n,
    };
    let pool = Arc::new(WorkerPool::new(workers));

    let (view_tx, view_rx) = channel::<ViewEvent>();
    let mut controller = ViewController::new(frame, cache, pool, view_tx, 40);

    if let Some(columns) = &args.columns {
        controller.set_projection(columns.clone());
    }
    if let Some(predicate) = &args.filter {
        controller.set_filter(predicate).map_err(|e| {
            color_eyre::eyre::eyre!("invalid --filter predicate: {e}")
        })?;
    }
    if let Some(key) = &args.sort_key {
        let direction = if args.descending {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        };
        // Startup sorts were asked for explicitly; no interactive confirmation.
        controller.set_sort(key, direction)?;
        controller.confirm_sort();
    }

    let render_opts = RenderOptions {
        row_numbers: config.display.row_numbers,
        ..Default::default()
    };
    Ok(App::new(args.path.clone(), controller, view_rx, render_opts))
}

fn render(terminal: &mut DefaultTerminal, app: &mut App) -> Result<()> {
    terminal.draw(|frame| frame.render_widget(app, frame.area()))?;
    Ok(())
}

fn run(mut terminal: DefaultTerminal, args: &Args, config: &AppConfig) -> Result<()> {
    let (app_tx, app_rx) = channel::<AppEvent>();
    let mut app = build_app(args, config)?;
    render(&mut terminal, &mut app)?;
    app.start();

    let poll_interval = std::time::Duration::from_millis(config.display.event_poll_interval_ms);
    loop {
        if crossterm::event::poll(poll_interval)? {
            match crossterm::event::read()? {
                crossterm::event::Event::Key(key) => app_tx.send(AppEvent::Key(key))?,
                crossterm::event::Event::Resize(cols, rows) => {
                    app_tx.send(AppEvent::Resize(cols, rows))?
                }
                _ => {}
            }
        }

        let mut updated = app.poll_engine();
        match app_rx.recv_timeout(std::time::Duration::from_millis(0)) {
            Ok(AppEvent::Exit) => break,
            Ok(event) => {
                if let Some(AppEvent::Exit) = app.event(&event) {
                    break;
                }
                updated = true;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if updated {
            render(&mut terminal, &mut app)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    color_eyre::install()?;

    let config = effective_config(&args)?;
    if config.debug.enabled {
        init_tracing()?;
    }

    let terminal = ratatui::init();
    let result = run(terminal, &args, &config);
    ratatui::restore();
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
