use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::{
    Router,
    extract::{
        Json, Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post, put},
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    Account, AccountKind, ContributionChange, DEFAULT_CHART_HORIZON_YEARS,
    DEFAULT_MILESTONE_HORIZON_YEARS, DEFAULT_MILESTONE_THRESHOLDS, EmergencyFundProgress,
    InvestmentSettings, Ledger, LedgerError, Milestone, MilestoneInputs, MilestoneOrigin,
    NetWorthEntry, ProjectionInputs, ProjectionPoint, YearMonth, derive_system_milestones,
    merge_milestones, project,
};

const INDEX_HTML: &str = include_str!("../../web/index.html");
const STYLES_CSS: &str = include_str!("../../web/styles.css");
const APP_JS: &str = include_str!("../../web/app.js");

const MAX_HORIZON_YEARS: i32 = 100;

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Personal finance dashboard with a compounding contribution projector"
)]
pub struct App {
    #[arg(
        long,
        env = "NESTEGG_LOG",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the dashboard and its JSON API
    Serve {
        #[arg(long, env = "NESTEGG_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Print a projection and its savings milestones as JSON
    Project(Cli),
}

#[derive(Args, Debug, Clone)]
struct Cli {
    #[arg(
        long,
        default_value_t = 0.0,
        allow_negative_numbers = true,
        help = "Starting balance, normally the sum of positive investment balances"
    )]
    present_value: f64,
    #[arg(long, default_value_t = 500.0, help = "Monthly contribution until changed")]
    monthly_contribution: f64,
    #[arg(
        long,
        default_value_t = 7.0,
        allow_negative_numbers = true,
        help = "Annual return in percent, divided by 12 for the monthly rate"
    )]
    annual_return_rate: f64,
    #[arg(long, default_value_t = DEFAULT_CHART_HORIZON_YEARS, help = "Projection horizon in years")]
    years: i32,
    #[arg(
        long = "change",
        value_parser = parse_contribution_change,
        help = "Scheduled contribution change as YYYY-MM=AMOUNT; repeatable"
    )]
    changes: Vec<ContributionChange>,
    #[arg(long, help = "First month of the projection is the month after this; defaults to now")]
    anchor: Option<YearMonth>,
    #[arg(
        long = "threshold",
        help = "Savings milestone threshold; repeatable, defaults to 50k/100k/250k/500k/1M"
    )]
    thresholds: Vec<f64>,
    #[arg(
        long,
        default_value_t = DEFAULT_MILESTONE_HORIZON_YEARS,
        help = "Horizon in years searched for milestone crossings"
    )]
    milestone_years: i32,
}

fn parse_contribution_change(arg: &str) -> Result<ContributionChange, String> {
    let (date, amount) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected YYYY-MM=AMOUNT, got {arg:?}"))?;
    let effective_date = date.trim().parse::<YearMonth>().map_err(|e| e.to_string())?;
    let amount = amount
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid amount {amount:?}: {e}"))?;
    Ok(ContributionChange {
        id: String::new(),
        effective_date,
        amount,
    })
}

#[derive(Debug)]
struct ProjectRequest {
    projection: ProjectionInputs,
    milestones: MilestoneInputs,
    anchor: Option<YearMonth>,
    custom_milestones: Vec<Milestone>,
}

fn build_inputs(cli: Cli) -> Result<ProjectRequest, String> {
    for (name, value) in [
        ("--present-value", cli.present_value),
        ("--monthly-contribution", cli.monthly_contribution),
        ("--annual-return-rate", cli.annual_return_rate),
    ] {
        if !value.is_finite() {
            return Err(format!("{name} must be a finite number"));
        }
    }

    if !(0..=MAX_HORIZON_YEARS).contains(&cli.years) {
        return Err(format!("--years must be between 0 and {MAX_HORIZON_YEARS}"));
    }

    if !(0..=MAX_HORIZON_YEARS).contains(&cli.milestone_years) {
        return Err(format!(
            "--milestone-years must be between 0 and {MAX_HORIZON_YEARS}"
        ));
    }

    if cli.changes.iter().any(|change| !change.amount.is_finite()) {
        return Err("--change amounts must be finite numbers".to_string());
    }

    if cli
        .thresholds
        .iter()
        .any(|threshold| !threshold.is_finite() || *threshold <= 0.0)
    {
        return Err("--threshold values must be > 0".to_string());
    }

    let mut thresholds = if cli.thresholds.is_empty() {
        DEFAULT_MILESTONE_THRESHOLDS.to_vec()
    } else {
        cli.thresholds
    };
    thresholds.sort_by(f64::total_cmp);
    thresholds.dedup();

    let changes: Vec<ContributionChange> = cli
        .changes
        .into_iter()
        .enumerate()
        .map(|(index, mut change)| {
            if change.id.is_empty() {
                change.id = (index + 1).to_string();
            }
            change
        })
        .collect();

    Ok(ProjectRequest {
        projection: ProjectionInputs {
            present_value: cli.present_value,
            monthly_contribution: cli.monthly_contribution,
            annual_return_rate_percent: cli.annual_return_rate,
            horizon_years: cli.years,
            contribution_changes: changes.clone(),
        },
        milestones: MilestoneInputs {
            current_positive_investment_total: cli.present_value,
            monthly_contribution: cli.monthly_contribution,
            annual_return_rate_percent: cli.annual_return_rate,
            contribution_changes: changes,
            thresholds,
            horizon_years: cli.milestone_years,
        },
        anchor: cli.anchor,
        custom_milestones: Vec::new(),
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        present_value: 0.0,
        monthly_contribution: 500.0,
        annual_return_rate: 7.0,
        years: DEFAULT_CHART_HORIZON_YEARS,
        changes: Vec::new(),
        anchor: None,
        thresholds: Vec::new(),
        milestone_years: DEFAULT_MILESTONE_HORIZON_YEARS,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectPayload {
    present_value: Option<f64>,
    monthly_contribution: Option<f64>,
    annual_return_rate: Option<f64>,
    years: Option<i32>,
    contribution_changes: Option<Vec<ContributionChange>>,
    anchor: Option<YearMonth>,
    thresholds: Option<Vec<f64>>,
    milestone_years: Option<i32>,
    custom_milestones: Option<Vec<CustomMilestonePayload>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomMilestonePayload {
    #[serde(default)]
    id: Option<String>,
    date: String,
    description: String,
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ProjectRequest, String> {
    let payload = serde_json::from_str::<ProjectPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: ProjectPayload) -> Result<ProjectRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.present_value {
        cli.present_value = v;
    }
    if let Some(v) = payload.monthly_contribution {
        cli.monthly_contribution = v;
    }
    if let Some(v) = payload.annual_return_rate {
        cli.annual_return_rate = v;
    }
    if let Some(v) = payload.years {
        cli.years = v;
    }
    if let Some(v) = payload.contribution_changes {
        cli.changes = v;
    }
    if let Some(v) = payload.anchor {
        cli.anchor = Some(v);
    }
    if let Some(v) = payload.thresholds {
        cli.thresholds = v;
    }
    if let Some(v) = payload.milestone_years {
        cli.milestone_years = v;
    }

    let mut request = build_inputs(cli)?;
    if let Some(custom) = payload.custom_milestones {
        request.custom_milestones = custom
            .into_iter()
            .enumerate()
            .map(|(index, milestone)| Milestone {
                id: milestone
                    .id
                    .unwrap_or_else(|| format!("custom-{}", index + 1)),
                date: milestone.date,
                description: milestone.description,
                origin: MilestoneOrigin::Custom,
            })
            .collect();
    }
    Ok(request)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    anchor: YearMonth,
    monthly_rate: f64,
    final_value: Option<f64>,
    points: Vec<ProjectionPoint>,
    milestones: Vec<Milestone>,
}

fn build_project_response(request: &ProjectRequest, anchor: YearMonth) -> ProjectResponse {
    let points = project(&request.projection, anchor);
    let system = derive_system_milestones(&request.milestones, anchor);
    ProjectResponse {
        anchor,
        monthly_rate: request.projection.annual_return_rate_percent / 100.0 / 12.0,
        final_value: points.last().map(|point| point.value),
        milestones: merge_milestones(&request.custom_milestones, &system),
        points,
    }
}

pub async fn run(app: App) -> Result<(), String> {
    match app.command {
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("Server error: {e}")),
        Command::Project(cli) => {
            let request = build_inputs(cli)?;
            let anchor = request.anchor.unwrap_or_else(YearMonth::current);
            let response = build_project_response(&request, anchor);
            let json = serde_json::to_string_pretty(&response)
                .map_err(|e| format!("Failed to encode projection: {e}"))?;
            println!("{json}");
            Ok(())
        }
    }
}

/// Shared state for the dashboard handlers. `fixed_today` pins the calendar
/// month used for net-worth entries and projection anchors.
#[derive(Clone)]
pub struct AppState {
    ledger: Arc<RwLock<Ledger>>,
    fixed_today: Option<YearMonth>,
}

impl AppState {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger: Arc::new(RwLock::new(ledger)),
            fixed_today: None,
        }
    }

    pub fn with_fixed_today(ledger: Ledger, today: YearMonth) -> Self {
        Self {
            fixed_today: Some(today),
            ..Self::new(ledger)
        }
    }

    fn today(&self) -> YearMonth {
        self.fixed_today.unwrap_or_else(YearMonth::current)
    }

    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .route("/styles.css", get(styles_handler))
        .route("/app.js", get(app_js_handler))
        .route(
            "/api/project",
            get(project_get_handler).post(project_post_handler),
        )
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/accounts", post(add_account_handler))
        .route(
            "/api/accounts/:kind/:id",
            put(update_balance_handler).delete(delete_account_handler),
        )
        .route("/api/net-worth", post(record_net_worth_handler))
        .route("/api/settings", put(settings_handler))
        .route(
            "/api/contribution-changes",
            post(add_contribution_change_handler),
        )
        .route(
            "/api/contribution-changes/:id",
            delete(delete_contribution_change_handler),
        )
        .route("/api/milestones", post(add_milestone_handler))
        .route("/api/milestones/:id", delete(delete_milestone_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState::new(Ledger::with_demo_data());
    {
        let today = state.today();
        state
            .write()
            .refresh_net_worth(today)
            .map_err(std::io::Error::other)?;
    }
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nestegg HTTP API listening");
    info!("Local access: http://127.0.0.1:{port}/");

    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    with_cache_control(Html(INDEX_HTML))
}

async fn styles_handler() -> impl IntoResponse {
    with_cache_control((
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        STYLES_CSS,
    ))
}

async fn app_js_handler() -> impl IntoResponse {
    with_cache_control((
        [(
            header::CONTENT_TYPE,
            "application/javascript; charset=utf-8",
        )],
        APP_JS,
    ))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<ProjectPayload>, QueryRejection>,
) -> Response {
    let Query(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    project_handler_impl(&state, payload)
}

async fn project_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<ProjectPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    project_handler_impl(&state, payload)
}

fn project_handler_impl(state: &AppState, payload: ProjectPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "projection request rejected");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };
    let anchor = request.anchor.unwrap_or_else(|| state.today());
    json_response(StatusCode::OK, build_project_response(&request, anchor))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountsResponse {
    bank: Vec<Account>,
    credit: Vec<Account>,
    investment: Vec<Account>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardResponse {
    today: YearMonth,
    net_worth: f64,
    positive_investment_total: f64,
    accounts: AccountsResponse,
    net_worth_history: Vec<NetWorthEntry>,
    emergency_fund: EmergencyFundProgress,
    settings: InvestmentSettings,
    contribution_changes: Vec<ContributionChange>,
    milestones: Vec<Milestone>,
    projection: Vec<ProjectionPoint>,
}

fn build_dashboard_response(ledger: &Ledger, today: YearMonth) -> DashboardResponse {
    DashboardResponse {
        today,
        net_worth: ledger.net_worth(),
        positive_investment_total: ledger.positive_investment_total(),
        accounts: AccountsResponse {
            bank: ledger.accounts(AccountKind::Bank).to_vec(),
            credit: ledger.accounts(AccountKind::Credit).to_vec(),
            investment: ledger.accounts(AccountKind::Investment).to_vec(),
        },
        net_worth_history: ledger.net_worth_history(),
        emergency_fund: ledger.emergency_fund_progress(),
        settings: ledger.settings(),
        contribution_changes: ledger.contribution_changes().to_vec(),
        milestones: ledger.all_milestones(today),
        projection: ledger.projection(today),
    }
}

async fn dashboard_handler(State(state): State<AppState>) -> Response {
    let today = state.today();
    let response = build_dashboard_response(&state.read(), today);
    json_response(StatusCode::OK, response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
    kind: AccountKind,
    name: String,
    balance: f64,
    #[serde(default)]
    interest: Option<String>,
}

async fn add_account_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewAccountPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let today = state.today();
    let result = state.write().add_account(
        payload.kind,
        &payload.name,
        payload.balance,
        payload.interest.as_deref(),
        today,
    );
    match result {
        Ok(account) => json_response(StatusCode::CREATED, account),
        Err(err) => ledger_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalancePayload {
    balance: f64,
}

async fn update_balance_handler(
    State(state): State<AppState>,
    path: Result<Path<(AccountKind, String)>, PathRejection>,
    payload: Result<Json<BalancePayload>, JsonRejection>,
) -> Response {
    let Path((kind, id)) = match path {
        Ok(path) => path,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let today = state.today();
    let mut ledger = state.write();
    if let Err(err) = ledger.update_balance(kind, &id, payload.balance, today) {
        return ledger_error_response(err);
    }
    match ledger.accounts(kind).iter().find(|account| account.id == id) {
        Some(account) => json_response(StatusCode::OK, account),
        None => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn delete_account_handler(
    State(state): State<AppState>,
    path: Result<Path<(AccountKind, String)>, PathRejection>,
) -> Response {
    let Path((kind, id)) = match path {
        Ok(path) => path,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let today = state.today();
    let result = state.write().delete_account(kind, &id, today);
    match result {
        Ok(account) => json_response(StatusCode::OK, account),
        Err(err) => ledger_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetWorthPayload {
    date: String,
    value: f64,
}

async fn record_net_worth_handler(
    State(state): State<AppState>,
    payload: Result<Json<NetWorthPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let date = match payload.date.parse::<YearMonth>() {
        Ok(date) => date,
        Err(_) => return ledger_error_response(LedgerError::InvalidDate(payload.date)),
    };
    let mut ledger = state.write();
    match ledger.record_net_worth(date, payload.value) {
        Ok(()) => json_response(StatusCode::OK, ledger.net_worth_history()),
        Err(err) => ledger_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SettingsPayload {
    monthly_contribution: Option<f64>,
    annual_return_rate: Option<f64>,
    emergency_fund_goal: Option<f64>,
    emergency_fund_account_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsResponse {
    settings: InvestmentSettings,
    emergency_fund: EmergencyFundProgress,
}

fn apply_settings(ledger: &mut Ledger, payload: SettingsPayload) -> Result<(), LedgerError> {
    let current = ledger.settings();
    ledger.set_investment_settings(
        payload
            .monthly_contribution
            .unwrap_or(current.monthly_contribution),
        payload
            .annual_return_rate
            .unwrap_or(current.annual_return_rate),
    )?;

    if payload.emergency_fund_goal.is_some() || payload.emergency_fund_account_id.is_some() {
        let fund = ledger.emergency_fund().clone();
        let account_id = payload
            .emergency_fund_account_id
            .or(fund.account_id)
            .ok_or_else(|| LedgerError::UnknownAccount {
                kind: AccountKind::Bank,
                id: String::new(),
            })?;
        let goal = payload.emergency_fund_goal.unwrap_or(fund.goal);
        ledger.set_emergency_fund(&account_id, goal)?;
    }
    Ok(())
}

async fn settings_handler(
    State(state): State<AppState>,
    payload: Result<Json<SettingsPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let mut ledger = state.write();
    // Apply to a copy so a rejected field leaves every setting untouched.
    let mut updated = ledger.clone();
    if let Err(err) = apply_settings(&mut updated, payload) {
        return ledger_error_response(err);
    }
    *ledger = updated;

    json_response(
        StatusCode::OK,
        SettingsResponse {
            settings: ledger.settings(),
            emergency_fund: ledger.emergency_fund_progress(),
        },
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewContributionChangePayload {
    date: String,
    amount: f64,
}

async fn add_contribution_change_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewContributionChangePayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let date = match payload.date.parse::<YearMonth>() {
        Ok(date) => date,
        Err(_) => return ledger_error_response(LedgerError::InvalidDate(payload.date)),
    };
    let result = state.write().add_contribution_change(date, payload.amount);
    match result {
        Ok(change) => json_response(StatusCode::CREATED, change),
        Err(err) => ledger_error_response(err),
    }
}

async fn delete_contribution_change_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let result = state.write().delete_contribution_change(&id);
    match result {
        Ok(change) => json_response(StatusCode::OK, change),
        Err(err) => ledger_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMilestonePayload {
    date: String,
    description: String,
}

async fn add_milestone_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewMilestonePayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let result = state
        .write()
        .add_milestone(&payload.date, &payload.description);
    match result {
        Ok(milestone) => json_response(StatusCode::CREATED, milestone),
        Err(err) => ledger_error_response(err),
    }
}

async fn delete_milestone_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let result = state.write().delete_milestone(&id);
    match result {
        Ok(milestone) => json_response(StatusCode::OK, milestone),
        Err(err) => ledger_error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    with_cache_control((status, Json(body)))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn rejection_response(msg: String) -> Response {
    warn!(error = %msg, "malformed request rejected");
    error_response(StatusCode::BAD_REQUEST, &msg)
}

fn ledger_error_response(err: LedgerError) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };
    warn!(error = %err, %status, "ledger command rejected");
    error_response(status, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        default_cli_for_api()
    }

    fn today() -> YearMonth {
        YearMonth::new(2025, 3).expect("valid month")
    }

    fn test_router() -> Router {
        build_router(AppState::with_fixed_today(Ledger::with_demo_data(), today()))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body.map_or_else(Body::empty, |json| Body::from(json.to_string())))
            .expect("valid request");
        router.clone().oneshot(request).await.expect("infallible")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn build_inputs_uses_default_thresholds_and_numbers_changes() {
        let mut cli = sample_cli();
        cli.changes = vec![
            parse_contribution_change("2026-01=700").expect("valid change"),
            parse_contribution_change("2027-06=900.5").expect("valid change"),
        ];

        let request = build_inputs(cli).expect("valid inputs");
        assert_eq!(
            request.milestones.thresholds,
            DEFAULT_MILESTONE_THRESHOLDS.to_vec()
        );
        assert_eq!(request.milestones.horizon_years, 25);
        assert_eq!(request.projection.horizon_years, 20);
        let ids: Vec<&str> = request
            .projection
            .contribution_changes
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_approx(request.projection.contribution_changes[1].amount, 900.5);
    }

    #[test]
    fn build_inputs_sorts_and_dedups_custom_thresholds() {
        let mut cli = sample_cli();
        cli.thresholds = vec![20_000.0, 5_000.0, 20_000.0];
        let request = build_inputs(cli).expect("valid inputs");
        assert_eq!(request.milestones.thresholds, vec![5_000.0, 20_000.0]);
    }

    #[test]
    fn build_inputs_rejects_out_of_range_years() {
        let mut cli = sample_cli();
        cli.years = -1;
        let err = build_inputs(cli).expect_err("negative years should fail");
        assert!(err.contains("--years"));

        let mut cli = sample_cli();
        cli.milestone_years = 101;
        let err = build_inputs(cli).expect_err("long horizon should fail");
        assert!(err.contains("--milestone-years"));
    }

    #[test]
    fn build_inputs_rejects_non_finite_and_non_positive_values() {
        let mut cli = sample_cli();
        cli.annual_return_rate = f64::INFINITY;
        let err = build_inputs(cli).expect_err("infinite rate should fail");
        assert!(err.contains("--annual-return-rate"));

        let mut cli = sample_cli();
        cli.thresholds = vec![0.0];
        let err = build_inputs(cli).expect_err("zero threshold should fail");
        assert!(err.contains("--threshold"));
    }

    #[test]
    fn parse_contribution_change_rejects_malformed_arguments() {
        assert!(parse_contribution_change("2026-01").is_err());
        assert!(parse_contribution_change("2026-13=10").is_err());
        assert!(parse_contribution_change("2026-01=lots").is_err());
    }

    #[test]
    fn cli_parses_project_subcommand() {
        let app = App::try_parse_from([
            "nestegg",
            "project",
            "--present-value",
            "10000",
            "--years",
            "1",
            "--change",
            "2026-01=700",
            "--anchor",
            "2025-03",
        ])
        .expect("valid arguments");
        let Command::Project(cli) = app.command else {
            panic!("expected project subcommand");
        };
        assert_approx(cli.present_value, 10_000.0);
        assert_eq!(cli.anchor, Some(today()));
        assert_eq!(cli.changes.len(), 1);
        assert_eq!(app.log_level, "info");
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let request = api_request_from_json(
            r#"{
                "presentValue": 10000,
                "monthlyContribution": 500,
                "annualReturnRate": 6,
                "years": 1,
                "anchor": "2025-03",
                "contributionChanges": [{"date": "2025-10", "amount": 700}],
                "thresholds": [15000],
                "customMilestones": [
                    {"id": "c1", "date": "2025", "description": "Start"}
                ]
            }"#,
        )
        .expect("valid payload");

        assert_approx(request.projection.present_value, 10_000.0);
        assert_eq!(request.projection.horizon_years, 1);
        assert_eq!(request.anchor, Some(today()));
        assert_eq!(request.custom_milestones.len(), 1);
        assert_eq!(request.milestones.thresholds, vec![15_000.0]);
        assert_eq!(request.projection.contribution_changes[0].id, "1");
    }

    #[test]
    fn api_custom_milestones_are_always_custom() {
        let request = api_request_from_json(
            r#"{"customMilestones": [
                {"date": "2030", "description": "Boat", "origin": "system"},
                {"id": "kept", "date": "Dec 2031", "description": "Cabin"}
            ]}"#,
        )
        .expect("valid payload");

        let ids: Vec<&str> = request
            .custom_milestones
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["custom-1", "kept"]);
        assert!(
            request
                .custom_milestones
                .iter()
                .all(|m| m.origin == MilestoneOrigin::Custom)
        );
    }

    #[test]
    fn project_response_matches_hand_calculation() {
        let request = api_request_from_json(
            r#"{"presentValue": 10000, "monthlyContribution": 500, "annualReturnRate": 6, "years": 1, "thresholds": [15000]}"#,
        )
        .expect("valid payload");
        let response = build_project_response(&request, today());

        assert_eq!(response.points.len(), 2);
        assert_approx(response.monthly_rate, 0.005);
        assert_eq!(response.final_value, Some(16_785.0));
        assert_eq!(response.milestones.len(), 1);
        assert_eq!(response.milestones[0].date, "Mar 2026");

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"finalValue\""));
        assert!(json.contains("\"monthlyRate\""));
        assert!(json.contains("\"period\":\"2025-09\""));
        assert!(json.contains("\"origin\":\"system\""));
    }

    #[tokio::test]
    async fn dashboard_reports_derived_figures() {
        let router = test_router();
        let response = send(&router, "GET", "/api/dashboard", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );

        let body = body_json(response).await;
        assert_approx(body["netWorth"].as_f64().unwrap(), 13_500.0);
        assert_approx(body["positiveInvestmentTotal"].as_f64().unwrap(), 25_000.0);
        assert_approx(body["emergencyFund"]["displayPercentage"].as_f64().unwrap(), 80.0);
        assert_eq!(body["projection"].as_array().unwrap().len(), 40);
        assert_eq!(body["accounts"]["investment"].as_array().unwrap().len(), 3);
        assert_eq!(body["today"], "2025-03");
    }

    #[tokio::test]
    async fn account_commands_update_net_worth_history() {
        let router = test_router();
        let response = send(
            &router,
            "POST",
            "/api/accounts",
            Some(r#"{"kind":"bank","name":"Credit Union","balance":2500,"interest":"4% APY"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let account = body_json(response).await;
        assert_eq!(account["interest"], "4% APY");

        let response = send(
            &router,
            "PUT",
            "/api/accounts/credit/1",
            Some(r#"{"balance":0}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(send(&router, "GET", "/api/dashboard", None).await).await;
        // 13500 + 2500 + 1500
        assert_approx(body["netWorth"].as_f64().unwrap(), 17_500.0);
        let history = body["netWorthHistory"].as_array().unwrap();
        let march: Vec<_> = history.iter().filter(|e| e["date"] == "2025-03").collect();
        assert_eq!(march.len(), 1);
        assert_approx(march[0]["value"].as_f64().unwrap(), 17_500.0);
    }

    #[tokio::test]
    async fn unknown_ids_return_not_found_and_bad_input_returns_bad_request() {
        let router = test_router();

        let response = send(&router, "DELETE", "/api/milestones/999", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"].is_string());

        let response = send(&router, "DELETE", "/api/accounts/investment/42", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &router,
            "POST",
            "/api/milestones",
            Some(r#"{"date":"whenever","description":"Boat"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &router,
            "POST",
            "/api/net-worth",
            Some(r#"{"date":"2025/04","value":1}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, "GET", "/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_requests_get_json_errors_with_no_store() {
        let router = test_router();
        let cases = [
            ("DELETE", "/api/accounts/savings/1", None),
            ("PUT", "/api/accounts/bank/1", Some(r#"{"amount":5}"#)),
            ("POST", "/api/milestones", Some(r#"{"date":"2030"}"#)),
            ("POST", "/api/accounts", Some("not json")),
            ("GET", "/api/project?years=many", None),
        ];

        for (method, uri, body) in cases {
            let response = send(&router, method, uri, body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{method} {uri}");
            assert_eq!(
                response.headers().get(header::CACHE_CONTROL).unwrap(),
                "no-store"
            );
            assert!(body_json(response).await["error"].is_string());
        }

        let body = body_json(send(&router, "GET", "/api/dashboard", None).await).await;
        assert_approx(body["netWorth"].as_f64().unwrap(), 13_500.0);
    }

    #[tokio::test]
    async fn settings_update_is_all_or_nothing() {
        let router = test_router();
        let response = send(
            &router,
            "PUT",
            "/api/settings",
            Some(r#"{"monthlyContribution":900,"emergencyFundGoal":-5}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(send(&router, "GET", "/api/dashboard", None).await).await;
        assert_approx(body["settings"]["monthlyContribution"].as_f64().unwrap(), 500.0);

        let response = send(
            &router,
            "PUT",
            "/api/settings",
            Some(r#"{"monthlyContribution":900,"emergencyFundAccountId":"1","emergencyFundGoal":10000}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_approx(body["settings"]["monthlyContribution"].as_f64().unwrap(), 900.0);
        assert_approx(body["emergencyFund"]["percentage"].as_f64().unwrap(), 50.0);
    }

    #[tokio::test]
    async fn milestone_and_contribution_commands_feed_the_timeline() {
        let router = test_router();
        let response = send(
            &router,
            "POST",
            "/api/milestones",
            Some(r#"{"date":"2025-06-15","description":"Sabbatical"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let milestone = body_json(response).await;
        assert_eq!(milestone["date"], "Jun 2025");

        let response = send(
            &router,
            "POST",
            "/api/contribution-changes",
            Some(r#"{"date":"2025-04","amount":0}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let change_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let body = body_json(send(&router, "GET", "/api/dashboard", None).await).await;
        let milestones = body["milestones"].as_array().unwrap();
        assert_eq!(milestones[0]["description"], "Sabbatical");
        assert_eq!(body["contributionChanges"].as_array().unwrap().len(), 2);

        let response = send(
            &router,
            "DELETE",
            &format!("/api/contribution-changes/{change_id}"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn project_endpoint_accepts_query_and_json() {
        let router = test_router();
        let response = send(
            &router,
            "GET",
            "/api/project?presentValue=10000&monthlyContribution=500&annualReturnRate=6&years=1",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["anchor"], "2025-03");
        assert_approx(body["finalValue"].as_f64().unwrap(), 16_785.0);

        let response = send(&router, "POST", "/api/project", Some(r#"{"years": 500}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, "POST", "/api/project", Some(r#"{"years": 0}"#)).await;
        let body = body_json(response).await;
        assert!(body["points"].as_array().unwrap().is_empty());
        assert!(body["finalValue"].is_null());
    }

    #[test]
    fn error_banner_is_shared_by_every_page() {
        let banner = INDEX_HTML.find(r#"id="error""#).expect("error banner");
        let first_page = INDEX_HTML.find(r#"class="page""#).expect("page section");
        assert!(banner < first_page);
        assert!(APP_JS.contains("resetOnSuccess: false"));
    }

    #[tokio::test]
    async fn static_assets_are_served() {
        let router = test_router();
        let response = send(&router, "GET", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, "GET", "/app.js", None).await;
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript; charset=utf-8"
        );
    }
}
