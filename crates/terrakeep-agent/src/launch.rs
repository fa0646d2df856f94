use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub port: u16,
    pub max_players: u32,
    pub world: String,
    pub world_size: u8,
    pub password: Option<String>,
}

const ENV_KEYS: &[(&str, &str)] = &[
    ("TERRAKEEP_PORT", "port"),
    ("TERRAKEEP_MAX_PLAYERS", "max_players"),
    ("TERRAKEEP_WORLD", "world"),
    ("TERRAKEEP_WORLD_SIZE", "world_size"),
    ("TERRAKEEP_PASSWORD", "password"),
];

/// Collects launch parameters from `TERRAKEEP_*` variables into a param map.
pub fn params_from_env() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (var, key) in ENV_KEYS {
        if let Ok(v) = std::env::var(var) {
            params.insert((*key).to_string(), v);
        }
    }
    params
}

pub fn validate_params(params: &BTreeMap<String, String>) -> anyhow::Result<LaunchParams> {
    let port = params
        .get("port")
        .map(|v| v.trim().parse::<u16>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("invalid port"))?
        .unwrap_or(7777);
    if port < 1024 {
        anyhow::bail!("port out of range: {port}");
    }

    let max_players = params
        .get("max_players")
        .map(|v| v.trim().parse::<u32>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("invalid max_players"))?
        .unwrap_or(8);
    if !(1..=255).contains(&max_players) {
        anyhow::bail!("max_players out of range: {max_players}");
    }

    let world = params
        .get("world")
        .cloned()
        .unwrap_or_else(|| "worlds/world.wld".to_string());
    if world.trim().is_empty() {
        anyhow::bail!("world must be non-empty");
    }

    // 1=Small, 2=Medium, 3=Large; only used when the world file is created.
    let world_size = params
        .get("world_size")
        .map(|v| v.trim().parse::<u8>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("invalid world_size"))?
        .unwrap_or(1);
    if !(1..=3).contains(&world_size) {
        anyhow::bail!("world_size out of range: {world_size}");
    }

    let password = params.get("password").cloned().filter(|s| !s.is_empty());

    Ok(LaunchParams {
        port,
        max_players,
        world,
        world_size,
        password,
    })
}

impl LaunchParams {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-port".to_string(),
            self.port.to_string(),
            "-players".to_string(),
            self.max_players.to_string(),
            "-world".to_string(),
            self.world.clone(),
            "-autocreate".to_string(),
            self.world_size.to_string(),
        ];
        if let Some(pw) = &self.password {
            args.push("-pass".to_string());
            args.push(pw.clone());
        }
        args.push("-secure".to_string());
        args.push("-noupnp".to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_produce_secure_args() {
        let p = validate_params(&BTreeMap::new()).unwrap();
        assert_eq!(p.port, 7777);
        assert_eq!(
            p.to_args(),
            vec![
                "-port", "7777", "-players", "8", "-world", "worlds/world.wld", "-autocreate",
                "1", "-secure", "-noupnp"
            ]
        );
    }

    #[test]
    fn password_is_passed_when_non_empty() {
        let p = validate_params(&params(&[("password", "123123")])).unwrap();
        let args = p.to_args();
        let i = args.iter().position(|a| a == "-pass").unwrap();
        assert_eq!(args[i + 1], "123123");

        let p = validate_params(&params(&[("password", "")])).unwrap();
        assert!(!p.to_args().contains(&"-pass".to_string()));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(validate_params(&params(&[("port", "80")])).is_err());
        assert!(validate_params(&params(&[("port", "nope")])).is_err());
        assert!(validate_params(&params(&[("max_players", "0")])).is_err());
        assert!(validate_params(&params(&[("world_size", "4")])).is_err());
        assert!(validate_params(&params(&[("world", "  ")])).is_err());
    }
}
