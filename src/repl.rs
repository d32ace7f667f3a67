//! Terminal front end - typed lines stand in for spoken utterances
//!
//! Lines go to the simulated recognizer, which reports them like speech.
//! Slash commands control the session directly.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use sop_voice::clock;
use sop_voice::command::CommandRegistry;
use sop_voice::config::Config;
use sop_voice::engine::RecognitionErrorKind;
use sop_voice::feedback::{LogFeedback, SharedFeedback};
use sop_voice::normalize::apply_spoken_punctuation;
use sop_voice::pipeline::CommandPipeline;
use sop_voice::service::{self, VoiceHandle};
use sop_voice::session::{ResultCallback, SessionEvent, SessionManager, SessionStatus};
use sop_voice::sim::{SimController, SimEngineFactory};
use sop_voice::sop::{builtin_commands, shared_draft, SharedDraft, SopDraft};

/// What recognized speech is fed into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Voice commands through the pipeline
    Command,
    /// Dictation into the draft
    Title,
    Step,
    Material,
}

impl Target {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "command" | "commands" => Some(Self::Command),
            "title" => Some(Self::Title),
            "step" => Some(Self::Step),
            "material" => Some(Self::Material),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Command => write!(f, "command"),
            Target::Title => write!(f, "title"),
            Target::Step => write!(f, "step"),
            Target::Material => write!(f, "material"),
        }
    }
}

type SharedPipeline = Arc<Mutex<CommandPipeline>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn callback_for(target: Target, pipeline: &SharedPipeline, draft: &SharedDraft) -> ResultCallback {
    match target {
        Target::Command => {
            let pipeline = Arc::clone(pipeline);
            Box::new(move |text: &str| {
                lock(&pipeline)
                    .process(text)
                    .map(|outcome| outcome.is_success())
                    .unwrap_or(false)
            })
        }
        dictation => {
            let draft = Arc::clone(draft);
            Box::new(move |text: &str| {
                let text = apply_spoken_punctuation(text);
                let mut draft = lock(&draft);
                match dictation {
                    Target::Title => draft.set_title(&text),
                    Target::Step => draft.add_step(&text),
                    Target::Material => draft.add_material(&text),
                    Target::Command => false,
                }
            })
        }
    }
}

fn print_draft(draft: &SopDraft) {
    println!("title: {}", draft.title.as_deref().unwrap_or("(untitled)"));
    println!("steps:");
    for (i, step) in draft.steps.iter().enumerate() {
        let marker = if i == draft.current_step { ">" } else { " " };
        println!("  {} {}. {}", marker, i + 1, step);
    }
    println!("materials:");
    for (i, material) in draft.materials.iter().enumerate() {
        println!("    {}. {}", i + 1, material);
    }
    if draft.save_requested {
        println!("(save requested)");
    }
}

fn print_help(pipeline: &SharedPipeline) {
    println!("Type what you would say. Slash commands:");
    println!("  /start [command|title|step|material]  start listening");
    println!("  /stop                                 stop listening");
    println!("  /error <code>                         simulate a recognizer error (no-speech, network, not-allowed, ...)");
    println!("  /hide                                 simulate the window being hidden");
    println!("  /continuous on|off                    toggle continuous listening");
    println!("  /status                               show session and draft");
    println!("  /quit                                 exit");
    println!("Voice commands:");
    for line in lock(pipeline).registry().help_lines() {
        println!("  {}", line);
    }
}

enum Flow {
    Continue,
    Quit,
}

struct Repl {
    handle: VoiceHandle,
    controller: SimController,
    pipeline: SharedPipeline,
    draft: SharedDraft,
    target: Cell<Target>,
}

impl Repl {
    async fn start(&self, target: Target) -> anyhow::Result<()> {
        self.target.set(target);
        let callback = callback_for(target, &self.pipeline, &self.draft);
        if !self.handle.start_listening(&target.to_string(), callback).await? {
            println!("(could not start listening)");
        }
        Ok(())
    }

    async fn slash(&self, input: &str) -> anyhow::Result<Flow> {
        let mut parts = input.trim_start_matches('/').split_whitespace();
        let cmd = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.collect::<Vec<_>>().join(" ");

        match cmd.as_str() {
            "help" | "h" => print_help(&self.pipeline),
            "start" | "listen" => {
                let target = if arg.is_empty() {
                    Some(Target::Command)
                } else {
                    Target::parse(&arg)
                };
                match target {
                    Some(target) => self.start(target).await?,
                    None => println!("(unknown target {:?})", arg),
                }
            }
            "stop" => {
                self.handle.stop_listening().await?;
            }
            "error" => {
                if arg.is_empty() {
                    println!("(usage: /error <code>)");
                } else {
                    self.controller.fail(RecognitionErrorKind::from_code(&arg));
                }
            }
            "hide" => self.handle.set_visibility(true)?,
            "continuous" => self.handle.set_continuous(arg != "off")?,
            "status" => {
                let (status, target) = self.handle.status().await?;
                match target {
                    Some(target) => println!("{} ({})", status, target),
                    None => println!("{}", status),
                }
                print_draft(&lock(&self.draft));
            }
            "quit" | "exit" | "q" => return Ok(Flow::Quit),
            _ => println!("(unknown command /{}, try /help)", cmd),
        }
        Ok(Flow::Continue)
    }

    /// Single-utterance sessions end after each result, so listen again
    /// for the last target before speaking
    async fn speak(&self, line: &str) -> anyhow::Result<()> {
        if !self.controller.is_running() {
            self.start(self.target.get()).await?;
        }
        if !self.controller.say(line) {
            println!("(not listening - /start to listen)");
        }
        Ok(())
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Interim { text, .. } => println!("  ... {}", text),
        SessionEvent::Status { status, .. } => match status {
            SessionStatus::Success => println!("  [ok]"),
            SessionStatus::Error => println!("  [failed]"),
            SessionStatus::Listening => println!("  [listening]"),
            SessionStatus::Idle | SessionStatus::Processing => {}
        },
        SessionEvent::RetryScheduled {
            attempt,
            delay,
            error,
        } => println!(
            "  [{} - retry {} in {}ms]",
            error,
            attempt,
            delay.as_millis()
        ),
        SessionEvent::Stopped { reason, .. } => println!("  [stopped: {:?}]", reason),
    }
}

pub async fn run(config: Config, target: Target) -> anyhow::Result<()> {
    let feedback: SharedFeedback = Arc::new(LogFeedback);
    let clock = clock::system();

    let draft = shared_draft();
    let mut registry = CommandRegistry::from_config(&config.commands);
    if config.commands.enable_builtin {
        for command in builtin_commands(&draft)? {
            registry.register(command);
        }
    }
    let pipeline = Arc::new(Mutex::new(CommandPipeline::new(
        &config,
        registry,
        Arc::clone(&feedback),
        Arc::clone(&clock),
    )));

    let (factory, controller) = SimEngineFactory::new();
    let manager = SessionManager::new(config.recognition.clone(), Box::new(factory), feedback, clock);
    let (handle, task) = service::spawn(manager);

    let unload = handle.clone();
    ctrlc::set_handler(move || {
        let _ = unload.unload();
    })?;

    let events = handle.subscribe().await?;
    let repl = Repl {
        handle,
        controller,
        pipeline,
        draft,
        target: Cell::new(target),
    };

    // Stdin reader thread
    let (input_tx, input_rx) = flume::unbounded::<String>();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if input_tx.send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    println!("sop-voice - type what you would say, /help for commands");
    repl.start(target).await?;

    loop {
        tokio::select! {
            line = input_rx.recv_async() => {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                if line.starts_with('/') {
                    if let Flow::Quit = repl.slash(&line).await? {
                        break;
                    }
                } else {
                    repl.speak(&line).await?;
                }
            }
            event = events.recv_async() => match event {
                Ok(event) => print_event(&event),
                // Service gone (Ctrl+C)
                Err(_) => break,
            },
        }
    }

    let _ = repl.handle.unload();
    task.await?;
    print_draft(&lock(&repl.draft));
    Ok(())
}
