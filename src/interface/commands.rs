//! # Built-in Commands
//!
//! The stock command set registered at startup. Network-bound commands run
//! their calls through `InterruptibleRequest` so the cancel keyword works
//! even while a request is blocked.

use std::time::Duration;

use anyhow::anyhow;

use crate::application::dispatcher::{ArgSpec, Command, CommandArgs, CommandContext};
use crate::application::group::TaskGroup;
use crate::application::request::InterruptibleRequest;
use crate::application::task::CancelToken;
use crate::check;
use crate::domain::error::BotError;
use crate::domain::message::{MessagePart, PartKind};

pub fn builtin_commands() -> Vec<Command> {
    vec![
        Command::new("help", "list commands, or describe one", ArgSpec::Raw, false, help).alias("h"),
        Command::new("echo", "repeat the given text", ArgSpec::Raw, false, echo),
        Command::new("status", "uptime and session statistics", ArgSpec::None, false, status),
        Command::new("fetch", "fetch a url and report the response", ArgSpec::Raw, true, fetch),
        Command::new(
            "search",
            "reverse image search across providers",
            ArgSpec::Typed { kind: PartKind::Image, count: 1 },
            true,
            search,
        ),
    ]
}

fn raw_arg(ctx: &CommandContext) -> &str {
    match &ctx.args {
        CommandArgs::Raw(text) => text.as_str(),
        _ => "",
    }
}

async fn help(ctx: CommandContext) -> Result<(), BotError> {
    let query = raw_arg(&ctx).trim();
    if !query.is_empty() {
        let Some(info) = ctx
            .commands
            .iter()
            .find(|c| c.name == query || c.aliases.iter().any(|a| a == query))
        else {
            return Err(BotError::validation(format!("no such command: {query}")));
        };
        let mut lines = vec![format!("{}: {}", info.name, info.description)];
        if !info.aliases.is_empty() {
            lines.push(format!("aliases: {}", info.aliases.join(", ")));
        }
        if info.cancelable {
            lines.push(format!(
                "can be stopped with \"{}\"",
                ctx.config.bot.cancel_keyword
            ));
        }
        return ctx.reply(&lines.join("\n")).await;
    }

    let mut lines = vec!["available commands:".to_string()];
    for info in ctx.commands.iter() {
        lines.push(format!("  {}: {}", info.name, info.description));
    }
    lines.push("send \"help <name>\" for details".to_string());
    ctx.reply(&lines.join("\n")).await
}

async fn echo(ctx: CommandContext) -> Result<(), BotError> {
    let text = raw_arg(&ctx).to_string();
    check!(!text.is_empty(), "nothing to echo");
    ctx.reply(&text).await
}

async fn status(ctx: CommandContext) -> Result<(), BotError> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let mut lines = vec![
        format!("uptime: {}s", uptime),
        format!("live sessions: {}", ctx.sessions.len()),
    ];
    if let Ok(friends) = ctx.gateway.get_friend_list().await {
        lines.push(format!("friends: {}", friends.len()));
    }
    ctx.reply(&lines.join("\n")).await
}

async fn fetch(ctx: CommandContext) -> Result<(), BotError> {
    let url = raw_arg(&ctx).trim().to_string();
    check!(!url.is_empty(), "usage: fetch <url>");
    check!(
        url.starts_with("http://") || url.starts_with("https://"),
        "only http(s) urls are supported"
    );

    let poll = Duration::from_millis(ctx.config.http.poll_interval_ms);
    let request_timeout = Duration::from_secs(ctx.config.http.request_timeout_secs);
    let client = reqwest::Client::new();
    let op = InterruptibleRequest::bound(&ctx.session, poll);
    let response = op.run(client.get(&url).timeout(request_timeout), None).await?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| BotError::Other(anyhow!("failed to read response body: {e}")))?;
    ctx.reply(&format!("{url}: {status}, {} bytes", body.len())).await
}

/// Reverse-image-search providers, queried in parallel.
fn search_providers(image_url: &str) -> Vec<(String, String)> {
    vec![
        (
            "saucenao".to_string(),
            format!("https://saucenao.com/search.php?url={image_url}"),
        ),
        (
            "ascii2d".to_string(),
            format!("https://ascii2d.net/search/url/{image_url}"),
        ),
        (
            "trace.moe".to_string(),
            format!("https://api.trace.moe/search?url={image_url}"),
        ),
    ]
}

/// Probes every provider concurrently and reports per-provider summaries in
/// completion order. Cancellation fans out to every in-flight probe.
async fn probe_providers(
    providers: Vec<(String, String)>,
    token: CancelToken,
    poll: Duration,
    request_timeout: Duration,
) -> Result<Vec<String>, BotError> {
    let client = reqwest::Client::new();
    let group = TaskGroup::from_fn(providers, move |(name, url): (String, String)| {
        let client = client.clone();
        async move {
            let op = InterruptibleRequest::new(poll);
            let response = op.run(client.get(&url).timeout(request_timeout), None).await?;
            let status = response.status();
            let body = response.bytes().await.map(|b| b.len()).unwrap_or(0);
            Ok(format!("{name}: {status}, {body} bytes"))
        }
    });
    group
        .start()
        .map_err(|e| BotError::Other(anyhow!("failed to start search group: {e}")))?;

    tokio::select! {
        _ = token.cancelled() => {
            let _ = group.request_cancel(Some(Duration::from_secs(2))).await;
            Err(BotError::cancelled("search cancelled"))
        }
        results = group.join(None) => {
            let results = results.map_err(|e| BotError::Other(anyhow!("search group failed: {e}")))?;
            Ok(results
                .into_iter()
                .map(|r| match r {
                    Ok(line) => line,
                    Err(err) => format!("lookup failed: {err}"),
                })
                .collect())
        }
    }
}

async fn search(ctx: CommandContext) -> Result<(), BotError> {
    let CommandArgs::Typed(parts) = &ctx.args else {
        return Err(BotError::validation("search needs an image"));
    };
    let Some(MessagePart::Image { url: Some(image_url), .. }) = parts.first() else {
        return Err(BotError::validation("the image has no retrievable url"));
    };

    let poll = Duration::from_millis(ctx.config.http.poll_interval_ms);
    let request_timeout = Duration::from_secs(ctx.config.http.request_timeout_secs);
    let lines = probe_providers(
        search_providers(image_url),
        ctx.token.clone(),
        poll,
        request_timeout,
    )
    .await?;
    ctx.reply(&lines.join("\n")).await
}
