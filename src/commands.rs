use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::extract::{ExtractionResult, Extractor};
use crate::fetch::PageFetcher;
use crate::models::{NewTrackedItem, User};
use crate::repo::TrackerRepo;
use crate::utils::error::AppError;

/// One inbound chat line, parsed. Constructed per message, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Track {
        url: String,
        target_price: Option<Decimal>,
    },
    List,
    Stop {
        index: usize,
    },
    Status,
    Help,
    Unrecognized {
        raw: String,
    },
}

/// Whitespace-delimited grammar with a case-insensitive command token.
/// Anything malformed collapses to `Unrecognized`; parsing never fails.
pub fn parse_command(text: &str) -> Command {
    let mut tokens = text.split_whitespace();

    let word = match tokens.next() {
        Some(word) => word.to_ascii_lowercase(),
        None => {
            return Command::Unrecognized {
                raw: text.to_string(),
            };
        }
    };

    let unrecognized = || Command::Unrecognized {
        raw: text.to_string(),
    };

    match word.as_str() {
        "track" => {
            let Some(url_token) = tokens.next() else {
                return unrecognized();
            };
            let url = match Url::parse(url_token) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
                _ => return unrecognized(),
            };

            let target_price = match tokens.next() {
                None => None,
                Some(token) => match Decimal::from_str(token) {
                    Ok(price) if price > Decimal::ZERO => Some(price),
                    _ => return unrecognized(),
                },
            };

            if tokens.next().is_some() {
                return unrecognized();
            }

            Command::Track {
                url: url.to_string(),
                target_price,
            }
        }
        "list" => Command::List,
        "stop" => {
            let index = tokens.next().and_then(|t| t.parse::<usize>().ok());
            match index {
                Some(index) if index >= 1 && tokens.next().is_none() => Command::Stop { index },
                _ => unrecognized(),
            }
        }
        "status" => Command::Status,
        "help" => Command::Help,
        _ => unrecognized(),
    }
}

pub fn help_text() -> String {
    "Available commands:\n\
     - track <url> [target_price] - Track a product URL with optional target price\n\
     - status - Check if the bot is running\n\
     - list - List all your tracked products\n\
     - stop <number> - Stop tracking a product by its number in the list\n\
     - help - Show this help message"
        .to_string()
}

const GENERIC_ERROR_REPLY: &str = "Something went wrong, please try again.";

/// Parses inbound chat lines, resolves the sending identity and executes
/// the command against the tracking repository. Every path returns a short
/// user-facing reply; internal errors are logged, never echoed.
pub struct CommandHandler {
    repo: Arc<dyn TrackerRepo>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Extractor,
    check_interval: Duration,
}

impl CommandHandler {
    pub fn new(
        repo: Arc<dyn TrackerRepo>,
        fetcher: Arc<dyn PageFetcher>,
        check_interval_secs: u64,
    ) -> Self {
        Self {
            repo,
            fetcher,
            extractor: Extractor::new(),
            check_interval: Duration::seconds(check_interval_secs as i64),
        }
    }

    pub async fn handle(&self, sender: &str, sender_name: Option<&str>, text: &str) -> String {
        let command = parse_command(text);
        info!(sender = %sender, ?command, "handling chat command");

        let user = match self.repo.get_or_create_user(sender, sender_name).await {
            Ok(user) => user,
            Err(e) => {
                error!(sender = %sender, error = %e, "failed to resolve sender identity");
                return GENERIC_ERROR_REPLY.to_string();
            }
        };

        match command {
            Command::Track { url, target_price } => self.handle_track(&user, url, target_price).await,
            Command::List => self.handle_list(&user).await,
            Command::Stop { index } => self.handle_stop(&user, index).await,
            Command::Status => "Bot is running and tracking products!".to_string(),
            Command::Help => help_text(),
            Command::Unrecognized { raw } => {
                warn!(sender = %sender, raw = %raw, "unrecognized command");
                "Unknown command. Type 'help' for available commands.".to_string()
            }
        }
    }

    /// One synchronous extraction up front so the sender gets instant
    /// feedback; the scheduler takes over from there.
    async fn handle_track(
        &self,
        user: &User,
        url: String,
        target_price: Option<Decimal>,
    ) -> String {
        let extraction = match self.fetcher.fetch(&url).await {
            Ok(content) => self.extractor.extract(&url, &content),
            Err(e) => ExtractionResult::Failure {
                reason: e.to_string(),
            },
        };

        let (title, scraped_price, warning) = match extraction {
            ExtractionResult::Success { title, price } => (title, Some(price), None),
            ExtractionResult::Failure { reason } => {
                warn!(url = %url, reason = %reason, "initial scrape failed");
                match target_price {
                    // A placeholder is still useful when the sender chose a
                    // target; the next scheduled check fills in history.
                    Some(_) => (
                        "Unknown Product".to_string(),
                        None,
                        Some("Warning: couldn't read the page right now; I'll keep retrying."),
                    ),
                    None => {
                        return "Couldn't read a price from that page. \
                                Give an explicit target: track <url> <target_price>."
                            .to_string();
                    }
                }
            }
        };

        let target = match target_price.or(scraped_price) {
            Some(target) => target,
            None => return GENERIC_ERROR_REPLY.to_string(),
        };

        // Placeholders get rechecked on the next tick, healthy items after
        // a full interval (the initial scrape counts as a check).
        let next_check_at = match scraped_price {
            Some(_) => Utc::now() + self.check_interval,
            None => Utc::now(),
        };

        let item = match self
            .repo
            .create_item(NewTrackedItem {
                user_id: user.id.clone(),
                url: url.clone(),
                title: title.clone(),
                target_price: target,
                next_check_at,
            })
            .await
        {
            Ok(item) => item,
            Err(AppError::AlreadyTracked) => {
                return "You're already tracking that URL.".to_string();
            }
            Err(e) => {
                error!(url = %url, error = %e, "failed to create tracked item");
                return GENERIC_ERROR_REPLY.to_string();
            }
        };

        if let Some(price) = scraped_price {
            if let Err(e) = self.repo.record_observation(&item.id, price, next_check_at).await {
                error!(item_id = %item.id, error = %e, "failed to record initial observation");
            }
        }

        match (scraped_price, warning) {
            (Some(price), _) => format!(
                "Now tracking: {} at ${}. Target price: ${}.",
                title, price, target
            ),
            (None, Some(warning)) => format!(
                "Now tracking: {}. Target price: ${}.\n{}",
                url, target, warning
            ),
            (None, None) => format!("Now tracking: {}. Target price: ${}.", url, target),
        }
    }

    async fn handle_list(&self, user: &User) -> String {
        let items = match self.repo.items_for_user(&user.id).await {
            Ok(items) => items,
            Err(e) => {
                error!(user_id = %user.id, error = %e, "failed to list items");
                return GENERIC_ERROR_REPLY.to_string();
            }
        };

        if items.is_empty() {
            return "No products are currently being tracked.".to_string();
        }

        let mut message = String::from("Currently tracked products:\n");
        for (i, item) in items.iter().enumerate() {
            let current = match self.repo.latest_observation(&item.id).await {
                Ok(Some(obs)) => format!("${}", obs.price),
                Ok(None) => "unknown".to_string(),
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "failed to read latest observation");
                    "unknown".to_string()
                }
            };
            message.push_str(&format!(
                "{}. {}\n   Current price: {}\n   Target price: ${}\n   URL: {}\n",
                i + 1,
                item.title,
                current,
                item.target_price,
                item.url
            ));
        }
        message
    }

    async fn handle_stop(&self, user: &User, index: usize) -> String {
        let items = match self.repo.items_for_user(&user.id).await {
            Ok(items) => items,
            Err(e) => {
                error!(user_id = %user.id, error = %e, "failed to list items for stop");
                return GENERIC_ERROR_REPLY.to_string();
            }
        };

        if items.is_empty() {
            return "No products are currently being tracked.".to_string();
        }

        if index < 1 || index > items.len() {
            return format!(
                "Invalid number. Please provide a number between 1 and {}.",
                items.len()
            );
        }

        let item = &items[index - 1];
        match self.repo.remove_item(&item.id).await {
            Ok(true) => format!("Stopped tracking: {}.", item.title),
            // Raced with another removal; the end state is what was asked for.
            Ok(false) => format!("Stopped tracking: {}.", item.title),
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to remove item");
                GENERIC_ERROR_REPLY.to_string()
            }
        }
    }
}
