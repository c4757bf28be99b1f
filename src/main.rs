use crossterm::style::Stylize;
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, List, ListItem};
use ratatui::{Terminal, TerminalOptions, Viewport};
use serde::Deserialize;
use station_core::collaborators::{
    worth_logging, CredentialCheck, JsonResultSink, LocalAssets, Operator, Prompt,
};
use station_core::firmware::ProcessRunner;
use station_core::psu::ScpiPsu;
use station_core::rf::{RfLink, Signal};
use station_core::{
    Collaborators, ConfigProvider, Controller, Fixture, LogSink, Severity, StationConfig, StationEvent, Variant,
};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "station.json";
const OPERATORS_FILE: &str = "operators.json";

// Longest a single pipeline run may take before the menu comes back.
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// Prints operator messages with a severity tag, timestamp and color.
struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn log(&self, message: &str, severity: Severity) {
        if !worth_logging(message) {
            return;
        }
        let line = format!(
            "[{}] {} - {}",
            severity.label(),
            chrono::Local::now().format("%d.%m.%Y %H:%M"),
            message.trim()
        );
        match severity {
            Severity::Info => println!("{}", line),
            Severity::Warning => println!("{}", line.yellow()),
            Severity::Error => println!("{}", line.red()),
            Severity::Debug => println!("{}", line.blue()),
            Severity::Success => println!("{}", line.green()),
        }
    }
}

// Asks the operator on the terminal.
struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&self, question: &str) -> bool {
        loop {
            match ask_line(&format!("{} [y/n]: ", question)).as_deref() {
                Some("y") | Some("Y") => return true,
                Some("n") | Some("N") | None => return false,
                _ => eprintln!("[ERROR] Please answer y or n."),
            }
        }
    }

    fn ask(&self, question: &str) -> Option<String> {
        ask_line(&format!("{} (empty to cancel): ", question)).filter(|s| !s.is_empty())
    }
}

#[derive(Deserialize)]
struct OperatorEntry {
    secret: String,
    role: String,
}

// Operators listed in a local JSON file: { "name": { "secret": "...", "role": "..." } }.
struct FileCredentials {
    path: PathBuf,
}

impl CredentialCheck for FileCredentials {
    fn verify(&self, user: &str, secret: &str) -> Option<Operator> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };
        let operators: HashMap<String, OperatorEntry> = match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("malformed {}: {}", self.path.display(), e);
                return None;
            }
        };
        operators
            .get(user)
            .filter(|entry| entry.secret == secret)
            .map(|entry| Operator {
                name: user.to_string(),
                role: entry.role.clone(),
            })
    }
}

fn ask_line(prompt: &str) -> Option<String> {
    print!("{}", prompt);
    let _ = io::stdout().flush();
    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    }
}

fn load_config(path: &Path) -> StationConfig {
    if !path.exists() {
        log::warn!("{} not found, using built-in defaults", path.display());
        return StationConfig::default();
    }
    match StationConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {}. Using built-in defaults.", e);
            StationConfig::default()
        }
    }
}

// The main entry point for the station.
fn main() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter(None, log::LevelFilter::Info);
    }
    builder.init();

    println!("==========================");
    println!("  Production Test Station ");
    println!("==========================");

    let config_path = match ask_line(&format!("Config file (default: {}): ", DEFAULT_CONFIG)) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG),
    };
    let config = Arc::new(load_config(&config_path));
    let console: Arc<dyn LogSink> = Arc::new(ConsoleSink);

    let rf = RfLink::new(config.rf.settings());
    if let Err(e) = rf.open() {
        console.warn(&format!("control board not available: {}", e));
    }
    let fixture = Arc::new(Fixture::new(
        Arc::clone(&config),
        rf,
        Box::new(ScpiPsu::new(config.psu.settings())),
        Arc::new(ProcessRunner),
        Arc::clone(&console),
    ));

    let provider: Arc<dyn ConfigProvider> = config.clone();
    let collaborators = Collaborators {
        log: Arc::clone(&console),
        prompt: Arc::new(StdinPrompt),
        assets: Arc::new(LocalAssets::new(Arc::clone(&provider))),
        results: Arc::new(JsonResultSink::new(config.results_dir.clone())),
        credentials: Arc::new(FileCredentials {
            path: PathBuf::from(OPERATORS_FILE),
        }),
    };
    let mut controller = Controller::new(provider, config.identifiers.clone(), fixture, collaborators);
    if controller.start_listener().is_err() {
        console.warn("fixture buttons are not available");
    }

    // Main menu loop.
    loop {
        drain_events(&mut controller);
        println!("\nDevice: {}  |  Operator: {}", controller.session().variant, operator_name(&controller));
        println!("  1. Sign in");
        println!("  2. Select device");
        println!("  3. Start unit");
        println!("  4. Retry failed step");
        println!("  5. Show checklist");
        println!("  6. Continue batch: {}", if controller.session().continue_batch { "on" } else { "off" });
        println!("  7. Exit");

        let Some(choice) = ask_line("> ") else {
            break;
        };
        match choice.as_str() {
            "1" => sign_in(&mut controller),
            "2" => select_device(&mut controller),
            "3" => {
                match controller.start_unit() {
                    Ok(Some(_)) => wait_for_pipeline(&mut controller),
                    Ok(None) => {}
                    Err(e) => eprintln!("[ERROR] {}", e),
                }
            }
            "4" => match controller.retry_current() {
                Ok(_) => wait_for_pipeline(&mut controller),
                Err(e) => eprintln!("[ERROR] {}", e),
            },
            "5" => {
                if let Err(e) = draw_checklist(&controller) {
                    eprintln!("[ERROR] Could not draw checklist: {}", e);
                }
            }
            "6" => {
                let on = !controller.session().continue_batch;
                controller.set_continue_batch(on);
            }
            "7" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1 to 7."),
        }
    }

    controller.shutdown();
}

fn operator_name(controller: &Controller) -> String {
    controller
        .operator()
        .map(|op| op.name.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn sign_in(controller: &mut Controller) {
    let Some(user) = ask_line("User: ") else { return };
    let Some(secret) = ask_line("Password: ") else { return };
    if let Err(e) = controller.sign_in(&user, &secret) {
        eprintln!("[ERROR] {}", e);
    }
}

fn select_device(controller: &mut Controller) {
    for (i, variant) in Variant::ALL.iter().enumerate() {
        println!("  {}: {}", i, variant);
    }
    let Some(choice) = ask_line("Select a device (number): ") else { return };
    let variant = match choice.parse::<usize>() {
        Ok(i) if i < Variant::ALL.len() => Variant::ALL[i],
        _ => {
            eprintln!("[ERROR] Invalid device selection.");
            return;
        }
    };
    match controller.change_variant(variant) {
        Ok(()) => {
            if !controller.run_until_idle(PIPELINE_TIMEOUT) {
                eprintln!("[ERROR] Asset preparation did not finish in time.");
            }
        }
        Err(e) => eprintln!("[ERROR] {}", e),
    }
}

fn wait_for_pipeline(controller: &mut Controller) {
    if !controller.run_until_idle(PIPELINE_TIMEOUT) {
        eprintln!("[ERROR] Pipeline did not finish in time.");
    }
    if let Err(e) = draw_checklist(controller) {
        log::debug!("checklist not drawn: {}", e);
    }
}

// Handles whatever arrived while the menu was waiting for input.
fn drain_events(controller: &mut Controller) {
    while let Some(event) = controller.poll(Duration::ZERO) {
        if event == StationEvent::Signal(Signal::StartWork) {
            println!("{}", "Fixture start button pressed, choose 3 to start the unit.".cyan());
        }
    }
}

fn draw_checklist(controller: &Controller) -> io::Result<()> {
    let session = controller.session();
    let mut items: Vec<ListItem> = session
        .checklist
        .iter()
        .map(|(step, done)| {
            let (mark, color) = if done {
                ("[x]", Color::Green)
            } else if session.failed_step == Some(step) {
                ("[!]", Color::Red)
            } else {
                ("[ ]", Color::Gray)
            };
            ListItem::new(Line::styled(format!("{} {}", mark, step), Style::default().fg(color)))
        })
        .collect();
    items.push(ListItem::new(Line::from(format!(
        "unit {}  address {}  verdict {}",
        session.unit_id.as_deref().unwrap_or("-"),
        session.address.as_deref().unwrap_or("-"),
        session.verdict.label()
    ))));

    let height = items.len() as u16 + 2;
    let mut terminal = Terminal::with_options(
        CrosstermBackend::new(io::stdout()),
        TerminalOptions {
            viewport: Viewport::Inline(height),
        },
    )?;
    let title = format!("{} - {:?}", session.variant, controller.state());
    terminal.draw(|frame| {
        let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
        frame.render_widget(list, frame.size());
    })?;
    println!();
    Ok(())
}
