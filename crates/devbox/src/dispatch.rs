//! Chat command dispatcher.
//!
//! Transport-agnostic: takes one line of text plus the caller's resolved
//! identity, enforces admin-only verbs, and renders a plain-text reply.
//! The chat protocol itself lives outside this crate.

use tracing::debug;

use crate::vm::{Orchestrator, OrchestratorError};

/// Parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Create,
    Status,
    StartVm,
    Stop,
    Destroy,
    Exec(String),
    WebTerminal,
    // Admin verbs
    Maintenance(bool),
    ConfigGpu(bool),
    ConfigRam(String),
    ConfigCpu(i64),
    ForceStop(i64),
    ForceDestroy(ForceTarget),
    AllowUser {
        user_id: i64,
        plan_id: String,
        username: Option<String>,
    },
    RemoveUser(i64),
    ListAllowed,
    AdminInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceTarget {
    User(i64),
    All,
}

impl Command {
    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Command::Maintenance(_)
                | Command::ConfigGpu(_)
                | Command::ConfigRam(_)
                | Command::ConfigCpu(_)
                | Command::ForceStop(_)
                | Command::ForceDestroy(_)
                | Command::AllowUser { .. }
                | Command::RemoveUser(_)
                | Command::ListAllowed
                | Command::AdminInfo
        )
    }

    /// Parse one chat line. Returns `Err` with a usage hint on malformed
    /// arguments, `Ok(None)` for lines that are not commands.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = parts.collect();

        let on_off = |args: &[&str], usage: &str| -> Result<bool, String> {
            match args.first().map(|s| s.to_lowercase()).as_deref() {
                Some("on") => Ok(true),
                Some("off") => Ok(false),
                _ => Err(usage.to_string()),
            }
        };

        let cmd = match verb {
            "/start" | "/help" => Command::Help,
            "/create" => Command::Create,
            "/status" => Command::Status,
            "/start_vm" => Command::StartVm,
            "/stop" => Command::Stop,
            "/destroy" => Command::Destroy,
            "/exec" => {
                if args.is_empty() {
                    return Err("Usage: /exec [command]".to_string());
                }
                Command::Exec(args.join(" "))
            }
            "/web_terminal" => Command::WebTerminal,
            "/maintenance" => Command::Maintenance(on_off(&args, "Usage: /maintenance [on|off]")?),
            "/config_gpu" => Command::ConfigGpu(on_off(&args, "Usage: /config_gpu [on|off]")?),
            "/config_ram" => {
                let value = args
                    .first()
                    .ok_or("Usage: /config_ram [value] (e.g. 4g, 512m)")?;
                Command::ConfigRam((*value).to_string())
            }
            "/config_cpu" => {
                let n: i64 = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or("Usage: /config_cpu [number]")?;
                Command::ConfigCpu(n)
            }
            "/force_stop" => {
                let id: i64 = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or("Usage: /force_stop [user_id]")?;
                Command::ForceStop(id)
            }
            "/force_destroy" => {
                let target = match args.first() {
                    Some(&"all") => ForceTarget::All,
                    Some(s) => ForceTarget::User(
                        s.parse().map_err(|_| "Usage: /force_destroy [user_id|all]")?,
                    ),
                    None => return Err("Usage: /force_destroy [user_id|all]".to_string()),
                };
                Command::ForceDestroy(target)
            }
            "/allow_user" => {
                let user_id: i64 = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or("Usage: /allow_user [user_id] [plan] [name]")?;
                let plan_id = args
                    .get(1)
                    .ok_or("Usage: /allow_user [user_id] [plan] [name]")?;
                Command::AllowUser {
                    user_id,
                    plan_id: (*plan_id).to_string(),
                    username: args.get(2).map(|s| (*s).to_string()),
                }
            }
            "/remove_user" => {
                let id: i64 = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or("Usage: /remove_user [user_id]")?;
                Command::RemoveUser(id)
            }
            "/list_allowed" => Command::ListAllowed,
            "/admin_info" => Command::AdminInfo,
            _ => return Ok(None),
        };
        Ok(Some(cmd))
    }
}

const HELP_TEXT: &str = "Welcome to the dev container manager.\n\
Commands:\n\
/create - Create a new VM\n\
/status - Check VM status\n\
/start_vm - Start your VM\n\
/stop - Stop your VM\n\
/destroy - Delete your VM\n\
/exec [cmd] - Run command in VM\n\
/web_terminal - Get a web terminal link";

/// Routes parsed commands into the orchestrator and renders replies.
#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Orchestrator,
    admin_id: i64,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator, admin_id: i64) -> Self {
        Self {
            orchestrator,
            admin_id,
        }
    }

    /// Handle one chat line from `caller` and produce the reply text.
    pub async fn handle(&self, caller: i64, line: &str) -> String {
        let cmd = match Command::parse(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return "Unknown command. Try /help.".to_string(),
            Err(usage) => return usage,
        };

        if cmd.is_admin_only() && caller != self.admin_id {
            return "Access denied. Admin only.".to_string();
        }

        debug!(caller, ?cmd, "dispatching command");
        self.run(caller, cmd).await
    }

    async fn run(&self, caller: i64, cmd: Command) -> String {
        let orch = &self.orchestrator;
        match cmd {
            Command::Help => HELP_TEXT.to_string(),

            Command::Create => match orch.create(caller).await {
                Ok(record) => {
                    let engine_id = record.engine_id.as_deref().unwrap_or("?");
                    format!(
                        "VM created.\n\
                         Container: {}\n\
                         SSH port: {}\n\
                         User: {}\n\
                         Password: {}\n\
                         Resources: {} RAM, {} CPU, GPU {}",
                        &engine_id[..engine_id.len().min(12)],
                        record
                            .ssh_port
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                        record.ssh_user,
                        record.ssh_password,
                        record.ram_limit,
                        record.cpu_threads,
                        if record.gpu { "on" } else { "off" },
                    )
                }
                Err(err) => render_error("create", &err),
            },

            Command::Status => match orch.status(caller).await {
                Ok(status) => {
                    let r = &status.record;
                    let mut out = format!(
                        "VM status: {}\nSSH port: {}\nUser: {} / {}",
                        r.state,
                        r.ssh_port
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                        r.ssh_user,
                        r.ssh_password,
                    );
                    if let Some(stats) = &status.stats {
                        out.push_str(&format!(
                            "\nCPU: {}\nRAM: {} ({})",
                            stats.cpu_percent, stats.mem_usage, stats.mem_percent
                        ));
                    }
                    out
                }
                Err(err) => render_error("status", &err),
            },

            Command::StartVm => match orch.start(caller).await {
                Ok(_) => "VM started.".to_string(),
                Err(err) => render_error("start", &err),
            },

            Command::Stop => match orch.stop(caller).await {
                Ok(()) => "VM stopped.".to_string(),
                Err(err) => render_error("stop", &err),
            },

            Command::Destroy => match orch.destroy(caller).await {
                Ok(()) => "VM destroyed and data removed.".to_string(),
                Err(err) => render_error("destroy", &err),
            },

            Command::Exec(command) => match orch.exec(caller, &command).await {
                Ok(output) if output.is_empty() => "(no output)".to_string(),
                Ok(output) => output,
                Err(err) => render_error("exec", &err),
            },

            Command::WebTerminal => match orch.web_terminal(caller).await {
                Ok(session) => format!("Web terminal ready: {}", session.url),
                Err(err) => render_error("web_terminal", &err),
            },

            Command::Maintenance(on) => match orch.set_maintenance(on).await {
                Ok(stopped) if on => {
                    format!("Maintenance mode ON. Stopped {stopped} VMs.")
                }
                Ok(_) => "Maintenance mode OFF. Users can create and start VMs.".to_string(),
                Err(err) => render_error("maintenance", &err),
            },

            Command::ConfigGpu(on) => match orch.set_default_gpu(on).await {
                Ok(()) => format!("GPU support set to {}", if on { "ON" } else { "OFF" }),
                Err(err) => render_error("config_gpu", &err),
            },

            Command::ConfigRam(value) => match orch.set_default_ram(&value).await {
                Ok(()) => format!("Default RAM set to {value}"),
                Err(err) => render_error("config_ram", &err),
            },

            Command::ConfigCpu(n) => match orch.set_default_cpu(n).await {
                Ok(()) => format!("Default CPU threads set to {n}"),
                Err(err) => render_error("config_cpu", &err),
            },

            Command::ForceStop(user_id) => match orch.force_stop(user_id).await {
                Ok(()) => format!("Stopped VM for user {user_id}."),
                Err(err) => render_error("force_stop", &err),
            },

            Command::ForceDestroy(ForceTarget::All) => match orch.destroy_all().await {
                Ok(count) => format!("Destroyed {count} VMs."),
                Err(err) => render_error("force_destroy", &err),
            },

            Command::ForceDestroy(ForceTarget::User(user_id)) => {
                match orch.destroy(user_id).await {
                    Ok(()) => format!("Destroyed VM for user {user_id}."),
                    Err(err) => render_error("force_destroy", &err),
                }
            }

            Command::AllowUser {
                user_id,
                plan_id,
                username,
            } => match orch
                .allow_user(user_id, &plan_id, username.as_deref(), Some(caller))
                .await
            {
                Ok(()) => format!("User {user_id} allowed on plan '{plan_id}'."),
                Err(err) => render_error("allow_user", &err),
            },

            Command::RemoveUser(user_id) => match orch.remove_user(user_id).await {
                Ok(None) => format!("User {user_id} removed from allow-list."),
                Ok(Some(container)) => format!(
                    "User {user_id} removed from allow-list. \
                     Container '{container}' still exists; use /force_destroy {user_id} to remove it."
                ),
                Err(err) => render_error("remove_user", &err),
            },

            Command::ListAllowed => match orch.list_allowed().await {
                Ok(users) if users.is_empty() => "Allow-list is empty.".to_string(),
                Ok(users) => {
                    let mut out = String::from("Allowed users:");
                    for user in users {
                        out.push_str(&format!(
                            "\n- {} ({}) plan '{}'",
                            user.user_id,
                            user.username.as_deref().unwrap_or("unnamed"),
                            user.plan_id,
                        ));
                    }
                    out
                }
                Err(err) => render_error("list_allowed", &err),
            },

            Command::AdminInfo => self.admin_info().await,
        }
    }

    async fn admin_info(&self) -> String {
        let orch = &self.orchestrator;
        let settings = match orch.global_settings().await {
            Ok(s) => s,
            Err(err) => return render_error("admin_info", &err),
        };
        let containers = match orch.list_containers().await {
            Ok(c) => c,
            Err(err) => return render_error("admin_info", &err),
        };

        let mut out = format!(
            "System configuration\n\
             Maintenance: {}\n\
             Default RAM: {}\n\
             Default CPU: {}\n\
             GPU enabled: {}\n\
             Provisioned containers: {}",
            if settings.maintenance { "ON" } else { "OFF" },
            settings.default_ram,
            settings.default_cpu,
            if settings.default_gpu { "yes" } else { "no" },
            containers.len(),
        );
        for c in &containers {
            out.push_str(&format!(
                "\n- user {}: {} (port {})",
                c.user_id,
                c.state,
                c.ssh_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ));
        }
        out
    }
}

fn render_error(op: &str, err: &OrchestratorError) -> String {
    match err {
        OrchestratorError::NotFound(_) => "You don't have a VM. Use /create to get one.".to_string(),
        OrchestratorError::AlreadyExists(_) => {
            "You already have a VM. Use /destroy first if you want a new one.".to_string()
        }
        OrchestratorError::NotAuthorized(_) => {
            "You are not authorized to use this service.".to_string()
        }
        OrchestratorError::MaintenanceActive => {
            "System is in maintenance mode. Try again later.".to_string()
        }
        _ => format!("{op} failed: {err}"),
    }
}
