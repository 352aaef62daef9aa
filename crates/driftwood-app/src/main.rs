//! Driftwood - the Shipwrecked dashboard in your terminal
//!
//! Every request to the remote site is tunneled through a Wisp server, the
//! same way the browser dashboard reaches it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use driftwood_adapters::{RedirectMode, Request, Session, SharedSettings, TunnelManager};
use driftwood_core::{
    aggregate_progress, compute_shells, gallery_to_metrics, generate_user_cluster_analysis,
    island_status, leaderboard, lookup_category, UserWithProjects,
};
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "driftwood",
    about = "Shipwrecked progress, shells and leaderboards over a Wisp tunnel",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a URL through the tunnel and print the body
    Fetch {
        url: String,
        /// Return redirects instead of following them
        #[arg(long)]
        manual: bool,
        /// Extra header as `name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Send the stored session cookie
        #[arg(long)]
        auth: bool,
    },
    /// Sign in by opening a magic link and keeping its session cookie
    Login { url: String },
    /// Show the signed-in user and their progress
    Me,
    /// Rank gallery users by progress, then shells
    Leaderboard {
        #[arg(long)]
        json: bool,
        /// Only show the first N entries
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Bucket gallery users into whales, shippers and newbies
    Clusters {
        #[arg(long)]
        json: bool,
        /// Show which bucket one user landed in
        #[arg(long)]
        user: Option<String>,
    },
    /// Show or change the Wisp server
    Server { url: Option<String> },
    /// Forget the stored session token
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let settings = SharedSettings::load();
    tracing::debug!(
        location = %settings.location(),
        wisp = %settings.wisp_server(),
        "loaded settings"
    );

    match args.command {
        Command::Server { url } => server(&settings, url),
        Command::Logout => {
            settings.update(|s| s.token = None)?;
            eprintln!("  Signed out.");
            Ok(())
        }
        command => {
            let tunnel = Arc::new(TunnelManager::standard(settings)?);
            let session = Session::new(tunnel);
            run(&session, command).await
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Fetch {
            url,
            manual,
            headers,
            auth,
        } => fetch(session, &url, manual, &headers, auth).await,
        Command::Login { url } => login(session, &url).await,
        Command::Me => me(session).await,
        Command::Leaderboard { json, limit } => show_leaderboard(session, json, limit).await,
        Command::Clusters { json, user } => clusters(session, json, user.as_deref()).await,
        Command::Server { .. } | Command::Logout => Ok(()),
    }
}

fn server(settings: &SharedSettings, url: Option<String>) -> Result<()> {
    match url {
        Some(url) => {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                anyhow::bail!("Wisp server must be a ws:// or wss:// URL");
            }
            settings.update(|s| s.wisp_server = url.clone())?;
            eprintln!("  Wisp server set to {url} ({})", settings.location());
        }
        None => println!("{}", settings.wisp_server()),
    }
    Ok(())
}

async fn fetch(
    session: &Session,
    url: &str,
    manual: bool,
    headers: &[String],
    auth: bool,
) -> Result<()> {
    let mut request = Request::get(url)?;
    if manual {
        request = request.redirect(RedirectMode::Manual);
    }
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header must look like `name: value`, got {header:?}"))?;
        request = request.header(name.trim(), value.trim())?;
    }

    let response = if auth {
        session.fetch_cookie(request).await?
    } else {
        session.tunnel().fetch(request).await?
    };

    eprintln!("  {} {}", response.status(), response.url());
    for (name, values) in response.raw_headers() {
        for value in values {
            eprintln!("  {name}: {value}");
        }
    }
    std::io::stdout().write_all(response.bytes())?;
    Ok(())
}

async fn login(session: &Session, url: &str) -> Result<()> {
    if !session.steal_token(url).await? {
        anyhow::bail!("That link did not set a session cookie. It may have expired.");
    }
    match session.fetch_me().await? {
        Some(user) => eprintln!("  Signed in as {}", user.display_name()),
        None => eprintln!("  Token stored, but the site rejected it."),
    }
    Ok(())
}

async fn me(session: &Session) -> Result<()> {
    let Some(user) = session.fetch_me().await? else {
        anyhow::bail!("Not signed in. Run `driftwood login <magic-link>` first.");
    };
    let projects = session.fetch_projects().await?;
    let progress = aggregate_progress(&projects);

    println!("{}", user.display_name());
    if let Some(email) = &user.email {
        println!("  {email}");
    }
    println!(
        "  progress  {:.1}% (viral {:.1}%, shipped {:.1}%, unshipped {:.1}%)",
        progress.total(),
        progress.viral,
        progress.shipped,
        progress.unshipped
    );
    println!("  shells    {}", compute_shells(&projects));
    if let Some(status) = island_status(&projects) {
        println!("  island    {status}");
    }
    println!("  projects  {}", projects.len());
    for project in &projects {
        let state = if project.viral {
            "viral"
        } else if project.shipped {
            "shipped"
        } else {
            "in progress"
        };
        println!(
            "    - {} ({state}, {:.1}h)",
            project.name,
            driftwood_core::effective_hours(project)
        );
    }
    Ok(())
}

async fn show_leaderboard(session: &Session, json: bool, limit: usize) -> Result<()> {
    let gallery = session.fetch_gallery().await?;
    let mut entries = leaderboard(UserWithProjects::group_by_owner(gallery));
    entries.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for (rank, entry) in entries.iter().enumerate() {
        println!(
            "{:>3}. {:<28} {:>6.1}%  {:>6} shells  {}",
            rank + 1,
            entry.user.user.display_name(),
            entry.progress.total(),
            entry.shells,
            entry.island.map(|s| s.as_str()).unwrap_or("")
        );
    }
    Ok(())
}

async fn clusters(session: &Session, json: bool, user: Option<&str>) -> Result<()> {
    let gallery = session.fetch_gallery().await?;
    let analysis = generate_user_cluster_analysis(&gallery_to_metrics(&gallery));

    if let Some(user_id) = user {
        match lookup_category(&analysis, user_id) {
            Some(category) => println!(
                "{} {} - {}",
                category.emoji(),
                category,
                category.description()
            ),
            None => println!("Unknown"),
        }
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    let clusters = &analysis.clusters;
    println!("{} users", analysis.total_users);
    for (name, count, percentage) in [
        ("whales", clusters.whales.count, clusters.whales.percentage),
        ("shippers", clusters.shippers.count, clusters.shippers.percentage),
        ("newbies", clusters.newbies.count, clusters.newbies.percentage),
    ] {
        println!("  {name:<9} {count:>5}  {percentage:>5.1}%");
    }
    let stats = &analysis.statistics;
    println!(
        "  hours     mean {:.1}  median {:.1}  p75 {:.1}  p90 {:.1}",
        stats.hours.mean, stats.hours.median, stats.hours.p75, stats.hours.p90
    );
    Ok(())
}
