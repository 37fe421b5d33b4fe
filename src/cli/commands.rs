use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::app::{AppContext, Result};
use crate::config::format_interval;
use crate::daemon::{shutdown_signal, HostEvent, Supervisor, SupervisorStatus};
use crate::domain::{Article, SessionDescriptor};
use crate::inactivity::Interaction;
use crate::normalizer::Normalizer;
use crate::session::{StaticAuth, Visibility, SESSION_KEY};
use crate::store::ReadStateStore;

/// Sign in and follow the feed. Each stdin line counts as a key press;
/// `hide` and `show` simulate the tab being hidden and shown again.
pub async fn run(ctx: Arc<AppContext>, user: &str) -> Result<()> {
    let poll = format_interval(ctx.config.feed.poll_interval_secs);
    let shadow = format_interval(ctx.config.feed.shadow_poll_interval_secs);
    let auth = Arc::new(StaticAuth::signed_in(user));
    let supervisor = Supervisor::new(ctx, auth);
    let status = supervisor.subscribe();

    let (host, host_rx) = mpsc::unbounded_channel();
    let stdin_task = tokio::spawn(read_host_events(host));
    let printer = tokio::spawn(print_new_articles(status));

    println!(
        "Following feed as {} (shadow poll every {}, fallback poll every {}; Ctrl-C to stop)",
        user, shadow, poll
    );
    let result = supervisor.run(host_rx, shutdown_signal()).await;

    stdin_task.abort();
    printer.abort();
    result
}

async fn read_host_events(host: mpsc::UnboundedSender<HostEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = match line.trim() {
            "hide" => HostEvent::Visibility(Visibility::Hidden),
            "show" => HostEvent::Visibility(Visibility::Visible),
            _ => HostEvent::Interaction(Interaction::KeyPress),
        };
        if host.send(event).is_err() {
            break;
        }
    }
}

async fn print_new_articles(mut status: tokio::sync::watch::Receiver<SupervisorStatus>) {
    let mut printed = HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        ticker.tick().await;
        let Some(articles) = status.borrow_and_update().articles.clone() else {
            continue;
        };
        let snapshot = articles.lock().snapshot();
        for article in snapshot.iter().rev() {
            if printed.insert(article.id.clone()) {
                println!("{}", format_article(article));
            }
        }
    }
}

pub async fn list_articles(ctx: &AppContext) -> Result<()> {
    let raws = ctx.transport.fetch_all().await?;
    let mut articles = Normalizer::new().normalize_batch(raws, ctx.clock.now());

    if articles.is_empty() {
        println!("No articles");
        return Ok(());
    }

    crate::articles::sort_for_display(&mut articles, ctx.clock.now());
    for article in &articles {
        println!("{}", format_article(article));
    }

    Ok(())
}

pub async fn sweep(ctx: &AppContext, user: &str) -> Result<()> {
    let manager = ctx.session_manager(Arc::new(StaticAuth::signed_in(user)));
    let expired = manager.startup_sweep(user).await?;
    println!("Expired {} abandoned sessions", expired);
    Ok(())
}

pub fn show_session(ctx: &AppContext) -> Result<()> {
    let Some(descriptor) = ctx.storage.get_json::<SessionDescriptor>(SESSION_KEY)? else {
        println!("No session");
        return Ok(());
    };

    let now = ctx.clock.now();
    let read = ReadStateStore::with_cap(ctx.storage.clone(), ctx.config.session.read_state_cap)
        .load(&descriptor.session_id)
        .len();

    println!("Session:   {}", descriptor.session_id);
    println!("User:      {}", descriptor.user_id);
    println!("Record:    {}", descriptor.record_id);
    println!(
        "Started:   {} ({} min ago)",
        descriptor.start_time.format("%Y-%m-%d %H:%M:%S"),
        descriptor.age(now).num_minutes()
    );
    println!("Idle:      {} min", descriptor.idle_for(now).num_minutes());
    if let Some(hidden) = descriptor.last_tab_hidden_time {
        println!("Hidden at: {}", hidden.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Read:      {} articles", read);

    Ok(())
}

pub async fn logout(ctx: &AppContext) -> Result<()> {
    let Some(descriptor) = ctx.storage.get_json::<SessionDescriptor>(SESSION_KEY)? else {
        println!("No session");
        return Ok(());
    };

    let manager = ctx.session_manager(Arc::new(StaticAuth::signed_in(&descriptor.user_id)));
    manager.attach_stored()?;
    manager.logout().await?;
    println!("Ended session {}", descriptor.session_id);
    Ok(())
}

fn format_article(article: &Article) -> String {
    let marker = if article.seen { " " } else { "●" };
    let source = article.source.as_deref().unwrap_or("-");
    format!(
        "{} {} [{}] {}",
        marker,
        article.timestamp.format("%Y-%m-%d %H:%M"),
        source,
        article.display_title()
    )
}
