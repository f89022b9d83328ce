//! HTTP server for the progress API
//!
//! `trellis serve` → starts a local JSON API over the KPI tree, formula
//! transparency, completion logging, and override endpoints

use crate::config::Config;
use crate::db::{Database, DbError};
use crate::formula::Formula;
use crate::recalc::Recalculator;
use crate::{stale, streak, tree};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(error: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Shape of GET /api/tree
#[derive(Serialize)]
pub struct TreeResponse {
    pub tree: Vec<tree::KpiTreeNode>,
    pub total_kpis: usize,
    pub last_calculated: Option<String>,
}

#[derive(Deserialize)]
struct VisionQuery {
    vision_id: i32,
}

#[derive(Deserialize)]
struct KpiQuery {
    kpi_id: i32,
}

#[derive(Deserialize)]
struct LogRequest {
    kpi_id: i32,
    date: Option<String>,
    completed: bool,
    value: Option<f64>,
}

#[derive(Deserialize)]
struct OverrideRequest {
    kpi_id: i32,
    percentage: f64,
    reason: String,
}

/// Start the progress API server
pub fn start_server(port: u16) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server = Server::http(&addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let url = format!("http://localhost:{}", port);

    eprintln!("\n\x1b[1;32m🌱 Trellis\x1b[0m");
    eprintln!("   Progress API: {}/api/tree?vision_id=1", url);
    eprintln!("   Press Ctrl+C to stop\n");

    // Handle requests
    for request in server.incoming_requests() {
        if let Err(e) = handle_request(request) {
            eprintln!("Error: {}", e);
        }
    }

    Ok(())
}

fn handle_request(request: Request) -> std::io::Result<()> {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url.as_str(), ""),
    };
    let method = request.method().clone();

    match (&method, path) {
        (&Method::Get, "/api/tree") => handle_tree(request, query),
        (&Method::Get, "/api/formula") => handle_formula(request, query),
        (&Method::Get, "/api/streak") => handle_streak(request, query),
        (&Method::Get, "/api/zombies") => handle_zombies(request, query),
        (&Method::Post, "/api/log") => handle_log(request),
        (&Method::Post, "/api/override") => handle_override(request),
        (&Method::Post, "/api/override/clear") => handle_override_clear(request),

        // 404
        _ => {
            let response = Response::from_string("Not found").with_status_code(404);
            request.respond(response)
        }
    }
}

fn json_response(json: String, status: u16) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(json)
        .with_status_code(status)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap())
}

fn respond_error(request: Request, status: u16, message: String) -> std::io::Result<()> {
    let json = serde_json::to_string(&ApiResponse::failure(message))?;
    request.respond(json_response(json, status))
}

fn respond_db_error(request: Request, error: DbError) -> std::io::Result<()> {
    let status = match &error {
        DbError::NotFound(_) => 404,
        DbError::Validation(_) | DbError::InvalidHierarchy(_) => 400,
        DbError::StaleWrite(_) => 409,
        DbError::Connection(_) | DbError::Query(_) | DbError::Pool(_) => 500,
    };
    respond_error(request, status, error.to_string())
}

fn respond_ok<T: Serialize>(request: Request, data: T) -> std::io::Result<()> {
    let json = serde_json::to_string(&ApiResponse::success(data))?;
    request.respond(json_response(json, 200))
}

fn handle_tree(request: Request, query: &str) -> std::io::Result<()> {
    let params: VisionQuery = match serde_urlencoded::from_str(query) {
        Ok(p) => p,
        Err(e) => return respond_error(request, 400, format!("Invalid query: {}", e)),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    match db.vision_records(params.vision_id) {
        Ok(records) => {
            let forest = tree::build_forest(&records);
            let response = TreeResponse {
                total_kpis: tree::count_tree_nodes(&forest),
                last_calculated: tree::latest_calculation_time(&forest),
                tree: forest,
            };
            respond_ok(request, response)
        }
        Err(e) => respond_db_error(request, e),
    }
}

fn handle_formula(request: Request, query: &str) -> std::io::Result<()> {
    let params: KpiQuery = match serde_urlencoded::from_str(query) {
        Ok(p) => p,
        Err(e) => return respond_error(request, 400, format!("Invalid query: {}", e)),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    match stored_formula(&db, params.kpi_id) {
        Ok(formula) => respond_ok(request, formula),
        Err(e) => respond_db_error(request, e),
    }
}

/// The breakdown exactly as the last recalculation persisted it - never a
/// fresh recomputation, so the numbers shown always match the cached row
pub fn stored_formula(db: &Database, kpi_id: i32) -> Result<Formula, DbError> {
    db.get_kpi(kpi_id)?;
    let cache = db.get_cache(kpi_id)?.ok_or_else(|| {
        DbError::NotFound(format!(
            "KPI {} has not been calculated yet. Log a completion first.",
            kpi_id
        ))
    })?;
    let json = cache.formula_json.ok_or_else(|| {
        DbError::NotFound(format!("no stored formula for KPI {}", kpi_id))
    })?;
    serde_json::from_str(&json)
        .map_err(|e| DbError::Validation(format!("stored formula is unreadable: {}", e)))
}

fn handle_streak(request: Request, query: &str) -> std::io::Result<()> {
    let params: KpiQuery = match serde_urlencoded::from_str(query) {
        Ok(p) => p,
        Err(e) => return respond_error(request, 400, format!("Invalid query: {}", e)),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    match streak::streak_summary(&db, params.kpi_id, Local::now().date_naive()) {
        Ok(summary) => respond_ok(request, summary),
        Err(e) => respond_db_error(request, e),
    }
}

fn handle_zombies(request: Request, query: &str) -> std::io::Result<()> {
    let params: VisionQuery = match serde_urlencoded::from_str(query) {
        Ok(p) => p,
        Err(e) => return respond_error(request, 400, format!("Invalid query: {}", e)),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    let config = Config::load();
    match db.vision_records(params.vision_id) {
        Ok(records) => {
            let zombies = stale::detect_zombies(
                &records,
                config.zombies.stale_days,
                config.zombies.page_size,
                Local::now(),
            );
            respond_ok(request, zombies)
        }
        Err(e) => respond_db_error(request, e),
    }
}

fn read_json_body<T: for<'de> Deserialize<'de>>(
    request: &mut Request,
) -> Result<T, String> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| format!("Failed to read body: {}", e))?;
    serde_json::from_str(&body).map_err(|e| format!("Invalid JSON: {}", e))
}

fn handle_log(mut request: Request) -> std::io::Result<()> {
    let req: LogRequest = match read_json_body(&mut request) {
        Ok(r) => r,
        Err(e) => return respond_error(request, 400, e),
    };

    let date = match req.date {
        Some(raw) => match crate::db::parse_date(&raw) {
            Some(d) => d,
            None => {
                return respond_error(request, 400, format!("Invalid date '{}' (expected YYYY-MM-DD)", raw))
            }
        },
        None => Local::now().date_naive(),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    let config = Config::load();
    let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
    match recalc.log_completion(req.kpi_id, date, req.completed, req.value) {
        Ok(outcome) => respond_ok(request, outcome),
        Err(e) => respond_db_error(request, e),
    }
}

fn handle_override(mut request: Request) -> std::io::Result<()> {
    let req: OverrideRequest = match read_json_body(&mut request) {
        Ok(r) => r,
        Err(e) => return respond_error(request, 400, e),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    let config = Config::load();
    let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
    match recalc.set_manual_override(req.kpi_id, req.percentage, &req.reason) {
        Ok(updated) => respond_ok(request, updated),
        Err(e) => respond_db_error(request, e),
    }
}

fn handle_override_clear(mut request: Request) -> std::io::Result<()> {
    let req: KpiQuery = match read_json_body(&mut request) {
        Ok(r) => r,
        Err(e) => return respond_error(request, 400, e),
    };

    let db = match Database::open() {
        Ok(db) => db,
        Err(e) => return respond_db_error(request, e),
    };

    let config = Config::load();
    let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
    match recalc.clear_manual_override(req.kpi_id) {
        Ok(updated) => respond_ok(request, updated),
        Err(e) => respond_db_error(request, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === ApiResponse Tests ===

    #[test]
    fn test_api_response_success() {
        let response: ApiResponse<String> = ApiResponse::success("hello".to_string());
        assert!(response.ok);
        assert_eq!(response.data, Some("hello".to_string()));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_api_response_failure() {
        let response = ApiResponse::failure("nope".to_string());
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("nope"));
    }

    #[test]
    fn test_api_response_serializes_to_json() {
        let response: ApiResponse<String> = ApiResponse::success("test".to_string());
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"ok\":true"));
        assert!(json.contains("\"data\":\"test\""));
        assert!(json.contains("\"error\":null"));
    }

    #[test]
    fn test_log_request_parses_with_optional_fields() {
        let req: LogRequest =
            serde_json::from_str(r#"{"kpi_id": 3, "completed": true}"#).unwrap();
        assert_eq!(req.kpi_id, 3);
        assert!(req.completed);
        assert!(req.date.is_none());
        assert!(req.value.is_none());
    }

    #[test]
    fn test_vision_query_parses() {
        let q: VisionQuery = serde_urlencoded::from_str("vision_id=7").unwrap();
        assert_eq!(q.vision_id, 7);
        assert!(serde_urlencoded::from_str::<VisionQuery>("vision_id=abc").is_err());
    }
}
