use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use baleen::config::Config;
use baleen::events::{self, Event, FeedItem, Subscription};
use baleen::pubsub::{meta, TOPIC_FEEDS, TOPIC_SUBSCRIPTIONS};
use baleen::service::{connect_broker, Baleen};

#[derive(Parser, Debug)]
#[command(name = "baleen", version, about = "An ingestion service for RSS and Atom feeds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the baleen ingestion service
    Run,

    /// Publish subscription events for new feeds
    #[command(name = "feeds:add")]
    FeedsAdd {
        /// Feed URL to subscribe to (repeatable)
        #[arg(long)]
        url: Vec<String>,

        /// OPML file (.opml/.xml/.json) of feeds to subscribe to
        #[arg(long, value_name = "FILE")]
        opml: Option<PathBuf>,
    },

    /// Publish feed item events for article URLs
    #[command(name = "posts:add")]
    PostsAdd {
        /// Article URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print the type and size of every message on the subscriptions topic
    Debug,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Config::load()?;
    init_tracing(&conf);

    match cli.command {
        Command::Run => run(conf).await,
        Command::FeedsAdd { url, opml } => feeds_add(conf, url, opml).await,
        Command::PostsAdd { urls } => posts_add(conf, urls).await,
        Command::Debug => debug(conf).await,
    }
}

fn init_tracing(conf: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(conf.log_level.to_lowercase()));

    if conf.console_log {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

async fn run(conf: Config) -> Result<()> {
    let service = Baleen::new(conf)?;
    service.run().await
}

async fn feeds_add(conf: Config, urls: Vec<String>, opml: Option<PathBuf>) -> Result<()> {
    let mut feed_urls = urls;
    if let Some(path) = &opml {
        let outline = baleen::opml::load(path)
            .with_context(|| format!("could not load outline from {}", path.display()))?;
        feed_urls.extend(outline.urls(&[]));
    }
    anyhow::ensure!(!feed_urls.is_empty(), "no feed urls given: use --url or --opml");

    let (publisher, _) = connect_broker(&conf)?;
    for feed_url in &feed_urls {
        let msg = events::marshal(&Event::Subscription(Subscription {
            feed_url: feed_url.clone(),
            ..Subscription::default()
        }))?;
        publisher.publish(TOPIC_SUBSCRIPTIONS, vec![msg]).await?;
        tracing::info!(url = %feed_url, "subscription published");
    }

    println!("published {} subscription(s)", feed_urls.len());
    Ok(())
}

async fn posts_add(conf: Config, urls: Vec<String>) -> Result<()> {
    let (publisher, _) = connect_broker(&conf)?;
    for url in &urls {
        let msg = events::marshal(&Event::FeedItem(FeedItem {
            link: url.clone(),
            ..FeedItem::default()
        }))?;
        publisher.publish(TOPIC_FEEDS, vec![msg]).await?;
        tracing::info!(url = %url, "feed item published");
    }

    println!("published {} feed item(s)", urls.len());
    Ok(())
}

async fn debug(conf: Config) -> Result<()> {
    let (_, subscriber) = connect_broker(&conf)?;
    let mut stream = subscriber.subscribe(TOPIC_SUBSCRIPTIONS).await?;

    eprintln!("listening on {TOPIC_SUBSCRIPTIONS}, ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            next = stream.next() => match next {
                None => return Ok(()),
                Some(msg) => {
                    println!(
                        "{} ({} bytes)",
                        msg.metadata.get(meta::TYPE_NAME),
                        msg.payload.len()
                    );
                    msg.ack();
                }
            }
        }
    }
}
