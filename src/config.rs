//! Carga y gestión de configuración de la aplicación (API de nomenklatura + revisión).

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_url: Url,
    pub api_key: Option<String>,
    pub server_addr: String,
    pub frontend_dir: String,
    pub open_browser: bool,
    pub http_timeout: Duration,
    /// Las sesiones sin actividad durante este tiempo se cierran.
    pub session_idle: Duration,

    pub review: ReviewSettings,
}

/// Parámetros del flujo de revisión.
#[derive(Clone, Debug)]
pub struct ReviewSettings {
    pub match_limit: usize,
    pub debounce: Duration,
    pub external_search_url: String,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            match_limit: 10,
            debounce: Duration::from_millis(500),
            external_search_url: "https://www.google.com/search?q=".to_string(),
        }
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo de una función arbitraria.
    /// Permite probar la configuración sin tocar el entorno del proceso.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_api_url = lookup("NOMENKLATURA_API_URL")
            .ok_or_else(|| anyhow!("Falta NOMENKLATURA_API_URL en el entorno"))?;
        let api_url = Url::parse(&raw_api_url)
            .map_err(|e| anyhow!("NOMENKLATURA_API_URL no es una URL válida ({raw_api_url}): {e}"))?;

        let api_key = lookup("NOMENKLATURA_API_KEY").filter(|k| !k.trim().is_empty());

        let server_addr =
            lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3323".to_string());
        let frontend_dir = lookup("FRONTEND_DIR").unwrap_or_else(|| "frontend".to_string());

        let open_browser = match lookup("OPEN_BROWSER") {
            Some(v) => parse_bool("OPEN_BROWSER", &v)?,
            None => true,
        };

        let http_timeout = Duration::from_secs(parse_number("HTTP_TIMEOUT_SECS", &lookup, 30)?);
        let session_idle_secs = parse_number("REVIEW_SESSION_IDLE_SECS", &lookup, 1800)?;
        if session_idle_secs == 0 {
            return Err(anyhow!("REVIEW_SESSION_IDLE_SECS debe ser mayor que cero"));
        }

        let defaults = ReviewSettings::default();
        let match_limit = parse_number("REVIEW_MATCH_LIMIT", &lookup, defaults.match_limit as u64)?;
        if match_limit == 0 {
            return Err(anyhow!("REVIEW_MATCH_LIMIT debe ser mayor que cero"));
        }
        let debounce_ms = parse_number(
            "REVIEW_DEBOUNCE_MS",
            &lookup,
            defaults.debounce.as_millis() as u64,
        )?;
        let external_search_url =
            lookup("EXTERNAL_SEARCH_URL").unwrap_or(defaults.external_search_url);

        Ok(Self {
            api_url,
            api_key,
            server_addr,
            frontend_dir,
            open_browser,
            http_timeout,
            session_idle: Duration::from_secs(session_idle_secs),
            review: ReviewSettings {
                match_limit: match_limit as usize,
                debounce: Duration::from_millis(debounce_ms),
                external_search_url,
            },
        })
    }
}

fn parse_number<F>(key: &str, lookup: &F, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| anyhow!("{key} debe ser un entero positivo, se recibió '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "si" | "sí" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(anyhow!("Valor booleano no soportado para {key}: {other}")),
    }
}
