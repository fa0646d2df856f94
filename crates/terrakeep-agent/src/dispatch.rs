//! Applies classified console events to server state.

use crate::{
    config::Verbosity,
    correlator::CorrelatorHandle,
    events::{self, GameEvent},
    players,
    state::ServerShared,
};

/// Everything a handler may touch.
pub struct DispatchContext<'a> {
    pub shared: &'a ServerShared,
    pub correlator: &'a CorrelatorHandle,
    pub verbosity: Verbosity,
}

fn echo(verbosity: Verbosity, line: &str) {
    match verbosity {
        Verbosity::Quiet => tracing::debug!(target: "terrakeep::console", "{line}"),
        Verbosity::Normal | Verbosity::Verbose => {
            tracing::info!(target: "terrakeep::console", "{line}")
        }
    }
}

/// Runs the handler for `event`. Never blocks beyond lock acquisition;
/// correlator notifications are fire-and-forget.
pub fn apply(ctx: &DispatchContext<'_>, event: GameEvent, line: &str) {
    let shared = ctx.shared;
    if ctx.verbosity == Verbosity::Verbose {
        tracing::debug!(event = event.kind().name(), "{line}");
    }

    match event {
        GameEvent::Connection { ip } => {
            ctx.correlator.connection(ip);
        }
        GameEvent::PlayerJoined { name } => {
            echo(ctx.verbosity, line);
            let _ = shared.queue.enqueue("playing");
            let _ = shared.queue.enqueue(format!("say Hello there {name}!"));
        }
        GameEvent::PlayerLeft { name } => {
            echo(ctx.verbosity, line);
            shared.players.remove(&name);
        }
        GameEvent::PlayerIdentified { name, ip } => {
            ctx.correlator.player_identified(ip.as_str(), name.as_str());
            let player = shared.players.new_or_update(&name, &ip);
            if events::is_illegal_name(&player.name) {
                players::kick(&shared.queue, &player, "Name is not allowed");
            }
        }
        GameEvent::PlayerChat { author, text } => {
            match ctx.verbosity {
                Verbosity::Quiet => tracing::debug!(target: "terrakeep::chat", %author, "{text}"),
                _ => tracing::info!(target: "terrakeep::chat", %author, "{text}"),
            }
            shared.push_chat(&author, &text);
        }
        GameEvent::PlayerBooted { ip, reason } => {
            tracing::info!(%ip, %reason, "failed connection");
        }
        GameEvent::PlayerBanned { ip, reason } => {
            tracing::info!(%ip, %reason, "banned connection");
        }
        GameEvent::ServerTime { .. } => echo(ctx.verbosity, line),
        GameEvent::ServerSeed(seed) => {
            tracing::debug!(%seed, "world seed");
            shared.update_metadata(|m| m.seed = Some(seed));
        }
        GameEvent::ServerMotd(motd) => {
            tracing::debug!(%motd, "motd");
            shared.update_metadata(|m| m.motd = Some(motd));
        }
        GameEvent::ServerPassword(password) => {
            shared.update_metadata(|m| m.password = Some(password));
        }
        GameEvent::ServerVersion(version) => {
            tracing::info!(%version, "server version");
            shared.update_metadata(|m| m.version = Some(version));
        }
        GameEvent::Unclassified => echo(ctx.verbosity, line),
    }
}
