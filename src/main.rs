use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};

use fitsync::approval::{ApprovalAction, ApprovalMachine, ApproveOutcome, ButtonConfig};
use fitsync::cache::{RequestKey, ScheduleParams};
use fitsync::config::Config;
use fitsync::coordinator::CancelToken;
use fitsync::logging;
use fitsync::store::{Granularity, PlanStatus, RestStore};
use fitsync::sync::DataSyncService;

#[derive(Parser, Debug)]
#[command(name = "fitsync")]
#[command(about = "Fetch and approve cached client workout schedules")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fitsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(ClapArgs, Debug)]
struct Window {
  /// Client id
  #[arg(long)]
  client: i64,

  /// First day of the window (YYYY-MM-DD or a timestamp)
  #[arg(long)]
  start: String,

  /// weekly (7 days) or monthly (28 days)
  #[arg(long, default_value = "weekly")]
  granularity: Granularity,
}

impl Window {
  fn params(&self) -> ScheduleParams {
    ScheduleParams::new(self.client, self.start.clone(), self.granularity)
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a schedule window as JSON
  Show {
    #[command(flatten)]
    window: Window,

    /// Skip the cache
    #[arg(long)]
    force: bool,
  },
  /// Approve the draft plan of a window
  Approve {
    #[command(flatten)]
    window: Window,

    /// Retry with backoff when approval fails
    #[arg(long)]
    retry: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let store = Arc::new(RestStore::new(&config.store, Config::get_api_key()?)?);
  let service = DataSyncService::new(store.clone(), &config.cache, &config.sync);

  let outcome = match args.command {
    Command::Show { window, force } => show(&service, &window, force).await,
    Command::Approve { window, retry } => {
      let machine = ApprovalMachine::new(&config.approval);
      approve(&service, &store, &machine, &window, retry).await
    }
  };

  service.shutdown();
  outcome
}

async fn show(service: &DataSyncService, window: &Window, force: bool) -> Result<()> {
  let params = if force {
    window.params().forced()
  } else {
    window.params()
  };
  let result = service.fetch(&params).await?;
  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}

async fn approve(
  service: &DataSyncService,
  store: &Arc<RestStore>,
  machine: &ApprovalMachine,
  window: &Window,
  retry: bool,
) -> Result<()> {
  let params = window.params();
  let range = RequestKey::from_params(&params)?.range()?;

  let current = service.fetch(&params).await?;
  if current.status == PlanStatus::NoPlan {
    return Err(eyre!("No plan for client {} in {}", params.client_id, range));
  }
  if !current.can_approve() {
    println!("Plan for {} is already approved", range);
    return Ok(());
  }

  let _progress = machine.subscribe(|new, _old, action| {
    eprintln!("[{}] {}", action, ButtonConfig::for_state(new).message);
  });
  machine.dispatch(ApprovalAction::PlanImported);

  let client_id = params.client_id;
  let store = store.as_ref();
  let approve_once = move || async move {
    store
      .approve_window(client_id, range, &CancelToken::new())
      .await
      .map(|()| ApproveOutcome { success: true })
  };

  let mut approved = machine.handle_approve(approve_once).await;
  while !approved && retry && machine.retry_info().can_retry {
    let info = machine.retry_info();
    eprintln!("Retrying ({}/{})", info.count + 1, info.max_retries);
    approved = machine
      .handle_retry(move || async move {
        let ok = approve_once().await.is_ok();
        machine.dispatch(if ok {
          ApprovalAction::ApproveSuccess
        } else {
          ApprovalAction::ApproveError
        });
        Ok::<_, std::convert::Infallible>(ok)
      })
      .await;
  }

  if !approved {
    return Err(eyre!(
      "Approval failed for client {} in {} (state: {})",
      params.client_id,
      range,
      machine.state()
    ));
  }

  service.invalidate_cache(&params);
  let refreshed = service.fetch(&params).await?;
  println!("Approved {} ({:?})", range, refreshed.status);
  Ok(())
}
