use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Extension, Path, Request},
    middleware,
    response::Html,
    routing::get,
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use utoipa::OpenApi;

use webtrack::config::ConfigArgs;
use webtrack::logging::init_tracing;
use webtrack::store::{CallFilter, SqliteStore, Store, ViewFilter};
use webtrack::track::{
    api_router, client_config, client_data, instantiate_app, track_call, HmacCodec, TrackContext,
    Tracker,
};

const DEFAULT_PORT: u16 = 8888;

#[derive(Parser)]
#[command(name = "webtrack")]
#[command(about = "Call/view tracking for axum web applications")]
#[command(long_about = "\
webtrack records the causal graph of HTTP requests in a web application:
page loads (instances), client-side state transitions (views), and traced
API calls with parent/child links across service boundaries.

TYPICAL WORKFLOW:

  1. webtrack serve                 # Run the demo application
  2. open http://localhost:8888/    # Load the page, click around
  3. webtrack calls                 # Inspect the recorded call graph
  4. webtrack views --instance 1    # Inspect one page load's timeline

For more details on each command, use: webtrack <command> --help
")]
struct Cli {
    /// Global configuration arguments
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo application server
    ///
    /// Serves a minimal page wired through the entry-point middleware and a
    /// couple of API routes wired through the call recorder.
    Serve(ServeArgs),

    /// List tracked calls, newest first
    Calls(CallsArgs),

    /// List recorded views, newest first
    Views(ViewsArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Consider all HTTP requests as authenticated as this user
    #[arg(long)]
    user: Option<String>,
}

#[derive(Args)]
struct CallsArgs {
    /// Only calls caused by this parent call
    #[arg(long)]
    parent: Option<i64>,

    /// Only calls attributed to this instance
    #[arg(long)]
    instance: Option<i64>,

    /// Only calls whose completion was never observed
    #[arg(long)]
    unfinished: bool,

    /// Maximum number of calls to list
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Print full records as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ViewsArgs {
    /// Only views belonging to this instance
    #[arg(long)]
    instance: Option<i64>,

    /// Maximum number of views to list
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Print full records as JSON
    #[arg(long)]
    json: bool,
}

/// OpenAPI documentation for the tracking API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "webtrack",
        description = "Call/view tracking API: clients POST view records here; \
                       calls are recorded transparently by the middleware."
    ),
    paths(webtrack::track::handlers::create_view),
    components(schemas(
        webtrack::track::NewView,
        webtrack::track::ErrorResponse,
        webtrack::track::ClientConfig,
        webtrack::track::ClientData,
    )),
    tags(
        (name = "Tracking", description = "Client-submitted tracking records"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.config.tracing_config());

    match cli.command {
        Commands::Serve(args) => serve(args, &cli.config).await,
        Commands::Calls(args) => list_calls(args, &cli.config).await,
        Commands::Views(args) => list_views(args, &cli.config).await,
    }
}

fn build_tracker(config: &ConfigArgs, user: Option<String>) -> Result<Tracker> {
    let store = Arc::new(SqliteStore::open(config.db.clone())?);
    let mut tracker = Tracker::new(store, config.app.clone()).strict(config.strict_tracking);
    if let Some(secret) = &config.cookie_secret {
        tracker = tracker.with_codec(Arc::new(HmacCodec::new(secret.as_bytes().to_vec())));
    }
    if let Some(user) = user {
        tracker = tracker.with_current_user(Arc::new(
            move |_req: &Request| -> anyhow::Result<Option<String>> { Ok(Some(user.clone())) },
        ));
    }
    Ok(tracker)
}

async fn serve(args: ServeArgs, config: &ConfigArgs) -> Result<()> {
    let tracker = build_tracker(config, args.user)?;

    // API routes run through the call recorder; the page route runs through
    // the entry-point middleware so each load creates an instance.
    let tracked = Router::new()
        .nest("/api/track", api_router(tracker.clone()))
        .route("/api/contacts", get(list_contacts))
        .route("/api/contacts/{id}", get(get_contact))
        .layer(middleware::from_fn_with_state(tracker.clone(), track_call));

    let pages = Router::new()
        .route("/", get(app_page))
        .layer(middleware::from_fn_with_state(tracker, instantiate_app));

    let app = Router::new()
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(tracked)
        .merge(pages);

    let port = config.port.unwrap_or(DEFAULT_PORT);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(
        listen = %listener.local_addr()?,
        db = %config.db.display(),
        app = %config.app,
        "Server started"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Base page of the demo application. Embeds the client config and the
/// instance id for this page load, the way a real application would.
async fn app_page(Extension(cx): Extension<TrackContext>) -> Html<String> {
    let config = serde_json::to_string(&client_config("/api/track"))
        .unwrap_or_else(|_| "null".to_string());
    let data =
        serde_json::to_string(&client_data(&cx)).unwrap_or_else(|_| "null".to_string());
    Html(format!(
        "<!doctype html>\n\
         <html>\n\
         <head><title>webtrack demo</title></head>\n\
         <body>\n\
         <h1>webtrack demo</h1>\n\
         <p>Try <a href=\"/api/contacts\">/api/contacts</a> or <a href=\"/api/contacts/1\">/api/contacts/1</a>.</p>\n\
         <script>\n\
         window.__trackClientConfig = {config};\n\
         window.__trackClientData = {data};\n\
         </script>\n\
         </body>\n\
         </html>\n"
    ))
}

async fn list_contacts() -> Json<Value> {
    Json(json!([
        {"id": 1, "name": "alice"},
        {"id": 2, "name": "bob"},
    ]))
}

async fn get_contact(Path(id): Path<i64>) -> Json<Value> {
    Json(json!({"id": id, "name": format!("contact-{id}")}))
}

async fn list_calls(args: CallsArgs, config: &ConfigArgs) -> Result<()> {
    let store = SqliteStore::open(config.db.clone())?;
    let calls = store
        .query_calls(&CallFilter {
            parent_call_id: args.parent,
            instance: args.instance,
            unfinished_only: args.unfinished,
            limit: Some(args.limit),
        })
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&calls)?);
        return Ok(());
    }
    for call in &calls {
        let outcome = match &call.status {
            Some(status) if status.panicked => "panicked".to_string(),
            Some(status) => format!(
                "{} {}B {}ms",
                status
                    .http_status
                    .map_or_else(|| "-".to_string(), |code| code.to_string()),
                status.body_length,
                (status.end - call.start).num_milliseconds(),
            ),
            None => "unfinished".to_string(),
        };
        let parent = call
            .parent_call_id
            .map_or_else(String::new, |p| format!(" parent=#{p}"));
        println!(
            "#{} {} {} -> {}{}",
            call.id, call.http_method, call.url, outcome, parent
        );
    }
    Ok(())
}

async fn list_views(args: ViewsArgs, config: &ConfigArgs) -> Result<()> {
    let store = SqliteStore::open(config.db.clone())?;
    let views = store
        .query_views(&ViewFilter {
            instance: args.instance,
            limit: Some(args.limit),
        })
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    for view in &views {
        println!(
            "instance {} seq {} {} at {}",
            view.instance, view.seq, view.state, view.date
        );
    }
    Ok(())
}
