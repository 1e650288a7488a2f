use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Args, Parser, Subcommand};
use exochat::logging::init_tracing;
use exochat::{
    ChatSession, FocusId, NavigationBridge, PagerError, QueryPager, Settings, SettingsError,
    SettingsStore, ViewKind,
};
use exochat_storage::{ConversationStore, Dataset, MessageId, MessageStore, QueryId};
use exochat_transport::{
    ChatTransport, HttpPageSource, ReplayTransport, StreamClient, TransportError, ValidationError,
    parse_dataset,
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Parser)]
#[command(name = "exochat", version, about = "Ask questions about exoplanet tables")]
struct Cli {
    /// Settings file; defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured answering service URL.
    #[arg(long, global = true)]
    api_base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Streams the answer to a question, then prints its result pages.
    Ask(AskArgs),
    /// Prints the effective settings as JSON.
    Settings {
        /// Writes the effective settings back to the settings file.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, Args)]
struct AskArgs {
    /// k2, toi or cum (kepler).
    #[arg(long, short, value_parser = parse_dataset)]
    dataset: Option<Dataset>,
    /// Result pages to print after the first one.
    #[arg(long, default_value_t = 0)]
    pages: u32,
    /// Replays a recorded answer stream instead of calling the service.
    #[arg(long)]
    replay: Option<PathBuf>,
    #[arg(required = true)]
    question: Vec<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to set up the service client on `{stage}`: {source}"))]
    Client {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("question rejected: {source}"))]
    Validation {
        stage: &'static str,
        source: ValidationError,
    },
    #[snafu(display("failed to read recorded stream {path:?} on `{stage}`: {source}"))]
    ReadReplay {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to page results on `{stage}`: {source}"))]
    Paging {
        stage: &'static str,
        source: PagerError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to render output on `{stage}`: {source}"))]
    Render {
        stage: &'static str,
        source: serde_json::Error,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };

    let mut settings = (*store.settings()).clone();
    if let Some(api_base_url) = cli.api_base_url {
        settings.api_base_url = api_base_url;
        settings = settings.normalized();
    }
    init_tracing(&settings.log_filter);

    match cli.command {
        Command::Ask(args) => ask(&settings, args).await,
        Command::Settings { save } => {
            let rendered = serde_json::to_string_pretty(&settings).context(RenderSnafu {
                stage: "render-settings",
            })?;
            println!("{rendered}");
            if save {
                store.update(settings).context(SaveSettingsSnafu {
                    stage: "save-settings",
                })?;
            }
            Ok(())
        }
    }
}

async fn ask(settings: &Settings, args: AskArgs) -> Result<(), CliError> {
    let client_config = settings.client_config();
    let transport: Arc<dyn ChatTransport> = match &args.replay {
        Some(path) => {
            let recorded = std::fs::read(path).context(ReadReplaySnafu {
                stage: "read-replay-file",
                path: path.clone(),
            })?;
            Arc::new(ReplayTransport::new([recorded]))
        }
        None => Arc::new(StreamClient::new(&client_config).context(ClientSnafu {
            stage: "build-stream-client",
        })?),
    };
    let page_source = HttpPageSource::new(&client_config).context(ClientSnafu {
        stage: "build-page-source",
    })?;

    let store = ConversationStore::new();
    let navigation = NavigationBridge::new();
    let focused_query = Arc::new(Mutex::new(None::<QueryId>));
    let results_focus = Arc::clone(&focused_query);
    let results_view = navigation.register(ViewKind::Results, move |id: FocusId| {
        *results_focus.lock().unwrap_or_else(PoisonError::into_inner) = Some(QueryId::new(id.0));
    });
    let conversation_view = navigation.register(ViewKind::Conversation, |id: FocusId| {
        println!("(results of answer #{id})");
    });

    let subscription = store.subscribe(answer_printer(store.clone()));
    let session = ChatSession::new(store.clone(), transport).with_navigation(navigation.clone());
    let dataset = args.dataset.unwrap_or(settings.default_dataset);
    let exchange = session
        .send_message(&args.question.join(" "), dataset)
        .await
        .context(ValidationSnafu {
            stage: "send-question",
        })?;
    subscription.unsubscribe();
    println!();

    if let Some(error) = store
        .message(exchange.assistant_message_id)
        .and_then(|answer| answer.error)
    {
        println!("[answer incomplete: {error}]");
    }

    let focused = *focused_query.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(query_id) = focused {
        let pager = QueryPager::new(store.clone(), Arc::new(page_source))
            .with_page_size(settings.page_size);
        print_pages(&pager, query_id, args.pages).await?;
        navigation.focus(ViewKind::Conversation, MessageId::from(query_id));
    }

    navigation.unregister(results_view);
    navigation.unregister(conversation_view);
    Ok(())
}

/// Conversation view for a terminal: prints the newest assistant text as it grows.
fn answer_printer(store: ConversationStore) -> impl Fn(u64) + Send + Sync + 'static {
    let printed = Mutex::new(0usize);
    move |_revision| {
        let messages = store.messages();
        let Some(answer) = messages.iter().rev().find(|message| message.is_assistant()) else {
            return;
        };

        let mut printed = printed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tail) = answer.text.get(*printed..)
            && !tail.is_empty()
        {
            print!("{tail}");
            let _ = std::io::stdout().flush();
            *printed = answer.text.len();
        }
    }
}

async fn print_pages(pager: &QueryPager, query_id: QueryId, extra_pages: u32) -> Result<(), CliError> {
    for page_index in 0..=extra_pages {
        let page = pager
            .fetch_page(query_id, page_index)
            .await
            .context(PagingSnafu {
                stage: "fetch-result-page",
            })?;

        println!("-- page {} ({} rows)", page.page_index + 1, page.rows.len());
        for row in &page.rows {
            let line = serde_json::to_string(row).context(RenderSnafu {
                stage: "render-row",
            })?;
            println!("{line}");
        }

        if !page.has_next {
            break;
        }
    }
    Ok(())
}
