use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use terrakeep_process::Player;

use crate::command_queue::CommandQueue;

/// Known players, unique by name. Written only by the output reader.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: RwLock<Vec<Player>>,
}

impl PlayerRegistry {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Player>> {
        self.players.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Player>> {
        self.players.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Updates the IP of an existing player or appends a new one.
    pub fn new_or_update(&self, name: &str, ip: &str) -> Player {
        let mut players = self.write();
        if let Some(p) = players.iter_mut().find(|p| p.name == name) {
            p.ip = ip.to_string();
            tracing::debug!(player = %name, %ip, "updated player");
            return p.clone();
        }
        let p = Player {
            name: name.to_string(),
            ip: ip.to_string(),
        };
        players.push(p.clone());
        tracing::info!(player = %name, %ip, "new player logged");
        p
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut players = self.write();
        let Some(i) = players.iter().position(|p| p.name == name) else {
            return false;
        };
        players.remove(i);
        tracing::info!(player = %name, "removed player");
        true
    }

    pub fn get(&self, name: &str) -> Option<Player> {
        self.read().iter().find(|p| p.name == name).cloned()
    }

    pub fn list(&self) -> Vec<Player> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

/// Announces and kicks a player. Success only means the commands were queued.
pub fn kick(queue: &CommandQueue, player: &Player, reason: &str) {
    tracing::info!(player = %player.name, %reason, "kicking player");
    let _ = queue.enqueue(format!("say Kicking {}: {}", player.name, reason));
    let _ = queue.enqueue(format!("kick {}", player.name));
}

/// Announces and bans a player. Success only means the commands were queued.
pub fn ban(queue: &CommandQueue, player: &Player, reason: &str) {
    tracing::info!(player = %player.name, %reason, "banning player");
    let _ = queue.enqueue(format!("say Banning {}: {}", player.name, reason));
    let _ = queue.enqueue(format!("ban {}", player.name));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_stay_unique() {
        let r = PlayerRegistry::default();
        r.new_or_update("Steve", "1.2.3.4");
        r.new_or_update("Steve", "5.6.7.8");
        r.new_or_update("Alex", "1.2.3.4");
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("Steve").unwrap().ip, "5.6.7.8");
    }

    #[test]
    fn remove_reports_whether_found() {
        let r = PlayerRegistry::default();
        r.new_or_update("Steve", "1.2.3.4");
        assert!(!r.remove("Alex"));
        assert!(r.remove("Steve"));
        assert!(r.is_empty());
        assert!(!r.remove("Steve"));
    }

    #[tokio::test]
    async fn kick_and_ban_queue_announcement_then_directive() {
        let q = CommandQueue::new(10);
        let mut rx = q.reset();
        let steve = Player {
            name: "Steve".to_string(),
            ip: "1.2.3.4".to_string(),
        };
        kick(&q, &steve, "Name is not allowed");
        ban(&q, &steve, "griefing");

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            got,
            vec![
                "say Kicking Steve: Name is not allowed\n",
                "kick Steve\n",
                "say Banning Steve: griefing\n",
                "ban Steve\n",
            ]
        );
    }
}
