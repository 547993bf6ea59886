// API models and session-aware client for TuBondi (legacy PHP transit backend)
// Backend observed at: https://micronauta4.dnsalias.net
//
// TuBondi Endpoints:
// - Session bootstrap: GET /web/urbano/?conf=<profile> (returns PHPSESSID cookie)
// - Command endpoint: POST /usuario/urbano2_cmd.php (form-encoded)
//   The backend is inconsistent about where it reads the command name from:
//   lineasyrutas, seleccionatraza, consultacocheporruta and vista take cmd as a
//   query-string parameter, proximos_arribos takes cmd as a form field.
// - HTTP 403 on any command call means the PHPSESSID session expired

use reqwest::blocking;
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::widget_store::WidgetConfiguration;

// ============================================================================
// Wire DTOs (field names follow the JSON observed from the backend)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinesRoutesResponse {
    #[serde(default)]
    pub lineas: Vec<LineDto>,
    #[serde(default)]
    pub rutas: Vec<RouteDto>,
    #[serde(default)]
    pub clientes: Vec<ClientDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDto {
    #[serde(rename = "linea_id")]
    pub id: String,
    #[serde(rename = "linea_nombre")]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub grupo: Option<String>,
    #[serde(default)]
    pub cliente: Option<i32>,
    #[serde(default)]
    pub rutas: Vec<RouteSummaryDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummaryDto {
    #[serde(rename = "ruta_id")]
    pub route_id: String,
    #[serde(rename = "ruta_nombre")]
    pub name: String,
    #[serde(default)]
    pub sentido: Option<String>,
    #[serde(default)]
    pub longitud: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDto {
    #[serde(rename = "ruta_id")]
    pub id: i32,
    #[serde(rename = "linea_id")]
    pub line_id: i32,
    #[serde(rename = "cliente_id")]
    pub client_id: i32,
    pub nombre: String,
    #[serde(default)]
    pub sentido: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDto {
    pub id: i32,
    pub nombre: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteSelectionResponse {
    #[serde(default)]
    pub paradas: Vec<StopDto>,
    #[serde(default)]
    pub notificaciones: Vec<BackendNotificationDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDto {
    pub codigo: String,
    pub descripcion: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub lineas: Vec<StopLineDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLineDto {
    #[serde(rename = "linea_id")]
    pub line_id: String,
    #[serde(rename = "linea_nombre")]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub operador: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrivalsResponse {
    #[serde(rename = "arribos", default)]
    pub arrivals: Vec<ArrivalDto>,
    #[serde(default)]
    pub parada: Option<StopDto>,
    #[serde(default)]
    pub notificacion: Option<BackendNotificationDto>,
    #[serde(default)]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrivalDto {
    #[serde(rename = "linea_nombre")]
    pub line_name: String,
    #[serde(rename = "linea_color", default)]
    pub color: Option<String>,
    #[serde(rename = "operador_nombre", default)]
    pub operator: Option<String>,
    #[serde(rename = "minutos_arribo", default)]
    pub eta_minutes: i32,
    #[serde(rename = "distancia", default)]
    pub distance_meters: Option<i32>,
    #[serde(rename = "codigo_parada")]
    pub stop_code: String,
    #[serde(rename = "sentido", default)]
    pub direction: Option<String>,
    #[serde(rename = "interno", default)]
    pub vehicle_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendNotificationDto {
    #[serde(default)]
    pub tipo: Option<String>,
    #[serde(default)]
    pub mensaje: Option<String>,
}

// ============================================================================
// Domain models (persisted inside configurations and render state)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub stop_code: String,
    pub line_name: String,
    pub eta_minutes: i32,
    #[serde(default)]
    pub distance_meters: Option<i32>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSelection {
    pub stop: Stop,
    #[serde(default)]
    pub selected_lines: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopArrivals {
    pub stop: Stop,
    pub arrivals: Vec<Arrival>,
    #[serde(default)]
    pub backend_message: Option<String>,
}

impl LineDto {
    fn to_domain(&self) -> Line {
        Line {
            id: derive_line_id(&self.id),
            name: self.name.clone(),
            color: self.color.clone(),
            operator: None,
        }
    }
}

impl StopLineDto {
    fn to_domain(&self) -> Line {
        Line {
            id: derive_line_id(&self.line_id),
            name: self.name.clone(),
            color: self.color.clone(),
            operator: self.operador.clone(),
        }
    }
}

impl StopDto {
    pub fn to_domain(&self) -> Stop {
        Stop {
            code: self.codigo.clone(),
            name: self.descripcion.clone(),
            latitude: self.lat,
            longitude: self.lon,
            lines: self.lineas.iter().map(|l| l.to_domain()).collect(),
        }
    }
}

impl ArrivalDto {
    fn to_domain(&self) -> Arrival {
        Arrival {
            stop_code: self.stop_code.clone(),
            line_name: self.line_name.clone(),
            eta_minutes: self.eta_minutes,
            distance_meters: self.distance_meters,
            direction: self.direction.clone(),
            vehicle_id: self.vehicle_id.clone(),
            operator: self.operator.clone(),
            color: self.color.clone(),
        }
    }
}

// ============================================================================
// Derived line identity
// ============================================================================
// The backend hands out line ids as strings that are usually, but not always,
// numeric. Configurations store the derived integer, so both derivations are
// part of the persisted contract and must stay stable across versions.

/// Identity for a line id string: numeric value when it parses, otherwise a
/// deterministic rolling hash of the string.
pub fn derive_line_id(raw: &str) -> i32 {
    raw.parse::<i32>().unwrap_or_else(|_| stable_hash(raw))
}

/// Identity guessed from a display name ("Linea 62 Roja" -> 62): the
/// concatenated digits when present, otherwise the hash of the full name.
pub fn line_id_from_name(name: &str) -> i32 {
    let digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<i32>().unwrap_or_else(|_| stable_hash(name))
}

// 31-multiplier rolling hash, wrapping on overflow.
fn stable_hash(s: &str) -> i32 {
    s.chars()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum TuBondiError {
    AuthError(String),
    NetworkError(String),
    ParseError(String),
    FileError(String),
}

impl std::fmt::Display for TuBondiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TuBondiError::AuthError(e) => write!(f, "Authentication error: {}", e),
            TuBondiError::NetworkError(e) => write!(f, "Network error: {}", e),
            TuBondiError::ParseError(e) => write!(f, "Parse error: {}", e),
            TuBondiError::FileError(e) => write!(f, "File error: {}", e),
        }
    }
}

impl std::error::Error for TuBondiError {}

pub type Result<T> = std::result::Result<T, TuBondiError>;

// ============================================================================
// Session-Aware Client
// ============================================================================

pub struct TuBondiClient {
    base_url: String,
    default_conf: String,
    http: blocking::Client,
    // {Unauthenticated, Authenticated(token)}. Held across bootstrap so
    // concurrent callers share a single in-flight bootstrap.
    session: Mutex<Option<String>>,
}

impl TuBondiClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://micronauta4.dnsalias.net";
    pub const DEFAULT_CONF: &'static str = "cbaciudad";
    const WEB_URBANO: &'static str = "/web/urbano/";
    const CMD_PATH: &'static str = "/usuario/urbano2_cmd.php";
    const SESSION_COOKIE: &'static str = "PHPSESSID";
    const USER_AGENT: &'static str = "TuBondiWidget/1.0 (WidgetBackend)";
    const CONNECT_TIMEOUT_SECS: u64 = 10;
    const REQUEST_TIMEOUT_SECS: u64 = 15;
    const MAX_SESSION_ATTEMPTS: u32 = 2;

    pub fn new() -> Result<Self> {
        Self::with_base_url(Self::DEFAULT_BASE_URL, Self::DEFAULT_CONF)
    }

    pub fn with_base_url(base_url: &str, default_conf: &str) -> Result<Self> {
        let http = blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(Self::CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TuBondiError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(TuBondiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_conf: default_conf.to_string(),
            http,
            session: Mutex::new(None),
        })
    }

    /// Bootstrap a fresh session unconditionally, replacing any held token.
    pub fn initialize_session(&self, conf: Option<&str>) -> Result<String> {
        let conf = self.conf_name(conf);
        let mut session = self.session_guard()?;
        let token = self.bootstrap(&conf)?;
        *session = Some(token.clone());
        Ok(token)
    }

    pub fn current_session(&self) -> Option<String> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn get_lines_and_routes(&self, conf: Option<&str>) -> Result<LinesRoutesResponse> {
        let conf_name = self.conf_name(conf);
        self.execute_with_session(&conf_name, |token| {
            let body = self.post_form(token, Some("lineasyrutas"), None, &conf_name, &[])?;
            serde_json::from_str(&body)
                .map_err(|e| TuBondiError::ParseError(format!("Invalid lineasyrutas response: {}", e)))
        })
    }

    pub fn select_route_trace(
        &self,
        ruta_id: i32,
        cliente_id: i32,
        conf: Option<&str>,
    ) -> Result<RouteSelectionResponse> {
        let conf_name = self.conf_name(conf);
        self.execute_with_session(&conf_name, |token| {
            let body = self.post_form(
                token,
                Some("seleccionatraza"),
                None,
                &conf_name,
                &[
                    ("ruta", ruta_id.to_string()),
                    ("cliente_id", cliente_id.to_string()),
                ],
            )?;
            serde_json::from_str(&body)
                .map_err(|e| TuBondiError::ParseError(format!("Invalid seleccionatraza response: {}", e)))
        })
    }

    pub fn get_arrivals(
        &self,
        stop_code: &str,
        conf: Option<&str>,
        show80: bool,
        onlygps: Option<&HashMap<i32, bool>>,
    ) -> Result<ArrivalsResponse> {
        let conf_name = self.conf_name(conf);
        // The backend wants the per-line GPS toggle map as a JSON-encoded form
        // field with stringified ids, "{}" when the caller has no preference.
        let onlygps_payload: HashMap<String, bool> = onlygps
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();
        let onlygps_json = serde_json::to_string(&onlygps_payload)
            .map_err(|e| TuBondiError::ParseError(format!("Failed to encode onlygps_array: {}", e)))?;

        self.execute_with_session(&conf_name, |token| {
            let body = self.post_form(
                token,
                None,
                Some("proximos_arribos"),
                &conf_name,
                &[
                    ("codigo", stop_code.to_string()),
                    ("show80min", show80.to_string()),
                    ("onlygps_array", onlygps_json.clone()),
                ],
            )?;
            serde_json::from_str(&body)
                .map_err(|e| TuBondiError::ParseError(format!("Invalid proximos_arribos response: {}", e)))
        })
    }

    /// Diagnostic query, opaque text response.
    pub fn query_vehicles_by_route(
        &self,
        ruta_id: i32,
        cliente_id: i32,
        stop_code: Option<&str>,
        conf: Option<&str>,
    ) -> Result<String> {
        let conf_name = self.conf_name(conf);
        let mut params = vec![
            ("ruta", ruta_id.to_string()),
            ("coche", "0".to_string()),
            ("cliente", cliente_id.to_string()),
        ];
        if let Some(code) = stop_code {
            if !code.is_empty() {
                params.push(("parada_seleccionada", code.to_string()));
            }
        }
        self.execute_with_session(&conf_name, |token| {
            self.post_form(token, Some("consultacocheporruta"), None, &conf_name, &params)
        })
    }

    /// Diagnostic query, opaque text response.
    pub fn get_view_bounds(&self, conf: Option<&str>) -> Result<String> {
        let conf_name = self.conf_name(conf);
        self.execute_with_session(&conf_name, |token| {
            self.post_form(token, Some("vista"), None, &conf_name, &[])
        })
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    // Bounded retry: at most MAX_SESSION_ATTEMPTS rounds of ensure-session +
    // command. A NetworkError (transport failure or 403) drops the token and
    // retries; a ParseError means the session was fine and the data was not,
    // so it propagates on any attempt. Bootstrap errors propagate directly.
    fn execute_with_session<T>(
        &self,
        conf: &str,
        op: impl Fn(&str) -> Result<T>,
    ) -> Result<T> {
        let mut last_error: Option<TuBondiError> = None;
        for _attempt in 0..Self::MAX_SESSION_ATTEMPTS {
            let token = self.ensure_session(conf)?;
            match op(&token) {
                Ok(value) => return Ok(value),
                Err(TuBondiError::NetworkError(msg)) => {
                    eprintln!("⚠️  TuBondi command failed ({}), dropping session", msg);
                    self.invalidate_session(&token)?;
                    last_error = Some(TuBondiError::NetworkError(msg));
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            TuBondiError::NetworkError("Session retry attempts exhausted".to_string())
        }))
    }

    fn ensure_session(&self, conf: &str) -> Result<String> {
        let mut session = self.session_guard()?;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let token = self.bootstrap(conf)?;
        *session = Some(token.clone());
        Ok(token)
    }

    // Only the caller whose token is still current clears it; a loser that
    // raced a fresh bootstrap must not clobber the winner's session.
    fn invalidate_session(&self, token: &str) -> Result<()> {
        let mut session = self.session_guard()?;
        if session.as_deref() == Some(token) {
            *session = None;
        }
        Ok(())
    }

    fn bootstrap(&self, conf: &str) -> Result<String> {
        let url = format!("{}{}?conf={}", self.base_url, Self::WEB_URBANO, conf);

        let response = self
            .http
            .get(&url)
            .header("User-Agent", Self::USER_AGENT)
            .send()
            .map_err(|e| TuBondiError::NetworkError(format!("Bootstrap request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TuBondiError::NetworkError(format!(
                "Bootstrap failed with status: {}",
                response.status()
            )));
        }

        let token = extract_session_cookie(response.headers()).ok_or_else(|| {
            TuBondiError::AuthError(format!(
                "{} cookie missing after bootstrap",
                Self::SESSION_COOKIE
            ))
        })?;

        println!("🔑 TuBondi session established (conf: {})", conf);
        Ok(token)
    }

    fn session_guard(&self) -> Result<MutexGuard<'_, Option<String>>> {
        self.session
            .lock()
            .map_err(|e| TuBondiError::NetworkError(format!("Session lock poisoned: {}", e)))
    }

    fn conf_name(&self, conf: Option<&str>) -> String {
        conf.unwrap_or(&self.default_conf).to_string()
    }

    // ------------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------------

    fn post_form(
        &self,
        token: &str,
        query_cmd: Option<&str>,
        body_cmd: Option<&str>,
        conf: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        let mut url = format!("{}{}", self.base_url, Self::CMD_PATH);
        if let Some(cmd) = query_cmd {
            url.push_str("?cmd=");
            url.push_str(cmd);
        }

        let mut form: Vec<(String, String)> = vec![("conf".to_string(), conf.to_string())];
        if let Some(cmd) = body_cmd {
            form.push(("cmd".to_string(), cmd.to_string()));
        }
        for (key, value) in params {
            form.push((key.to_string(), value.clone()));
        }

        let response = self
            .http
            .post(&url)
            .header("Accept-Language", "es-419")
            .header("User-Agent", Self::USER_AGENT)
            .header("Cookie", format!("{}={}", Self::SESSION_COOKIE, token))
            .form(&form)
            .send()
            .map_err(|e| TuBondiError::NetworkError(format!("Command request failed: {}", e)))?;

        if response.status().as_u16() == 403 {
            return Err(TuBondiError::NetworkError("Session expired (HTTP 403)".to_string()));
        }
        if !response.status().is_success() {
            return Err(TuBondiError::NetworkError(format!(
                "Backend returned HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .map_err(|e| TuBondiError::NetworkError(format!("Failed to read command response: {}", e)))
    }
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            if name.trim() == TuBondiClient::SESSION_COOKIE && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
}

// ============================================================================
// Domain composition (per-configuration aggregation)
// ============================================================================

impl TuBondiClient {
    pub fn fetch_lines(&self, conf: Option<&str>) -> Result<Vec<Line>> {
        let payload = self.get_lines_and_routes(conf)?;
        Ok(payload.lineas.iter().map(|l| l.to_domain()).collect())
    }

    pub fn fetch_stops_for_route(
        &self,
        ruta_id: i32,
        cliente_id: i32,
        conf: Option<&str>,
    ) -> Result<Vec<Stop>> {
        let payload = self.select_route_trace(ruta_id, cliente_id, conf)?;
        Ok(payload.paradas.iter().map(|p| p.to_domain()).collect())
    }

    /// One StopArrivals per configured selection, in selection order. A stop
    /// whose fetch fails keeps its slot with the error as backend_message so
    /// the remaining stops still refresh; only a configuration where every
    /// stop failed surfaces an error.
    pub fn fetch_arrivals_for_config(
        &self,
        config: &WidgetConfiguration,
    ) -> Result<Vec<StopArrivals>> {
        let mut results = Vec::with_capacity(config.selections.len());
        let mut failures = 0usize;
        let mut last_error: Option<TuBondiError> = None;

        for selection in &config.selections {
            match self.get_arrivals(&selection.stop.code, Some(&config.conf), false, None) {
                Ok(response) => results.push(compose_stop_arrivals(&response, selection)),
                Err(e) => {
                    eprintln!(
                        "⚠️  Arrivals fetch failed for stop {}: {}",
                        selection.stop.code, e
                    );
                    failures += 1;
                    results.push(StopArrivals {
                        stop: selection.stop.clone(),
                        arrivals: Vec::new(),
                        backend_message: Some(e.to_string()),
                    });
                    last_error = Some(e);
                }
            }
        }

        if failures > 0 && failures == config.selections.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        Ok(results)
    }
}

fn compose_stop_arrivals(response: &ArrivalsResponse, selection: &StopSelection) -> StopArrivals {
    let stop = response
        .parada
        .as_ref()
        .map(|p| p.to_domain())
        .unwrap_or_else(|| selection.stop.clone());

    StopArrivals {
        stop,
        arrivals: filter_arrivals(response, selection),
        backend_message: response.err.clone().or_else(|| {
            response
                .notificacion
                .as_ref()
                .and_then(|n| n.mensaje.clone())
        }),
    }
}

fn filter_arrivals(response: &ArrivalsResponse, selection: &StopSelection) -> Vec<Arrival> {
    let allowed: HashSet<i32> = selection.selected_lines.iter().copied().collect();
    response
        .arrivals
        .iter()
        .filter(|a| allowed.is_empty() || allowed.contains(&line_id_from_name(&a.line_name)))
        .map(|a| a.to_domain())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
