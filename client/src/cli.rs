use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{ApiError, DeploymentInfo, DeploymentSpec, JobInfo, JobRequest, ProcessMessage};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el dealer")]
struct Cli {
    /// URL base del dealer
    #[arg(long, env = "DEALER_URL", default_value = "http://localhost:3000")]
    dealer_url: String,

    #[arg(long, short, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operaciones sobre jobs
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Operaciones sobre procesos
    #[command(subcommand)]
    Procs(ProcCommands),
    /// Operaciones sobre deployments
    #[command(subcommand)]
    Deploys(DeployCommands),
}

#[derive(Subcommand)]
enum JobCommands {
    List,
    Get {
        #[arg(value_name = "JOB")]
        name: String,
    },
    /// Crea un job para una función
    Create {
        #[arg(value_name = "JOB")]
        name: String,
        #[arg(long)]
        function: String,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long)]
        tasks: usize,
        #[arg(long)]
        max_allocation: Option<usize>,
    },
    /// Redefine el total de tareas; sin --tasks sólo se reanuda
    Update {
        #[arg(value_name = "JOB")]
        name: String,
        #[arg(long)]
        tasks: Option<usize>,
        #[arg(long)]
        max_allocation: Option<usize>,
    },
    Delete {
        #[arg(value_name = "JOB")]
        name: String,
    },
}

#[derive(Subcommand)]
enum ProcCommands {
    List,
    Get {
        #[arg(value_name = "PROCESO")]
        name: String,
    },
    Delete {
        #[arg(value_name = "PROCESO")]
        name: String,
    },
    /// Cambia el estado del proceso (ready, notready, failed, deleted)
    State {
        #[arg(value_name = "PROCESO")]
        name: String,
        #[arg(value_name = "ESTADO")]
        state: String,
    },
}

#[derive(Subcommand)]
enum DeployCommands {
    List,
    /// Aplica un deployment desde un archivo JSON
    Apply {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
    },
    Remove {
        #[arg(value_name = "FUNCION")]
        function: String,
        #[arg(long, default_value = "")]
        version: String,
    },
}

struct Dealer {
    client: Client,
    base: String,
}

impl Dealer {
    fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.context("no se pudo contactar al dealer")?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        match resp.json::<ApiError>().await {
            Ok(err) => bail!("el dealer respondió {}: {}", err.status, err.error),
            Err(_) => bail!("el dealer respondió {}", status),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        Ok(self.send(req).await?.json().await?)
    }
}

fn print_job(job: &JobInfo) {
    println!("Job {}/{}:", job.namespace, job.name);
    println!("  función: {} {}", job.function, job.version);
    println!("  estado: {}", job.state);
    println!(
        "  tareas: {} asignadas, {} completadas de {}",
        job.assigned_tasks,
        job.completed_tasks.len(),
        job.total_tasks
    );
    for task in &job.tasks {
        println!(
            "    #{} {} en {} ({:.0}%)",
            task.id,
            task.state,
            task.process,
            task.progress * 100.0
        );
    }
}

fn print_process(proc: &ProcessMessage) {
    println!(
        "Proceso {} ({}) estado={} ip={}:{} tareas={}",
        proc.key(),
        proc.function,
        proc.state,
        proc.ip,
        proc.port,
        proc.task_count()
    );
    for (job, short) in &proc.jobs {
        let ids: Vec<String> = short
            .tasks
            .iter()
            .map(|t| format!("{}:{}", t.id, t.state))
            .collect();
        println!("  {}: [{}]", job, ids.join(", "));
    }
}

fn print_deployment(dep: &DeploymentInfo) {
    println!(
        "Deployment {}/{}{} réplicas={} activo={}",
        dep.namespace,
        dep.function,
        if dep.version.is_empty() {
            String::new()
        } else {
            format!(":{}", dep.version)
        },
        dep.replicas,
        dep.active
    );
    println!("  jobs: {}", dep.jobs.join(", "));
    println!("  procesos: {}", dep.processes.join(", "));
}

fn job_create_request(
    namespace: &str,
    name: String,
    function: String,
    version: String,
    total_tasks: usize,
    max_task_allocation: Option<usize>,
) -> JobRequest {
    JobRequest {
        name,
        namespace: namespace.to_string(),
        function,
        version,
        total_tasks,
        max_task_allocation,
        metadata: None,
    }
}

fn job_patch(tasks: Option<usize>, max_allocation: Option<usize>) -> serde_json::Value {
    let mut patch = json!({});
    if let Some(total) = tasks {
        patch["totalTasks"] = json!(total);
    }
    if let Some(max) = max_allocation {
        patch["maxTaskAllocation"] = json!(max);
    }
    patch
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let dealer = Dealer::new(&cli.dealer_url);
    let ns = cli.namespace;

    match cli.command {
        Commands::Jobs(cmd) => match cmd {
            JobCommands::List => {
                let jobs: Vec<JobInfo> = dealer
                    .fetch(dealer.client.get(dealer.url(&format!("/jobs/{ns}"))))
                    .await?;
                if jobs.is_empty() {
                    println!("No hay jobs en {ns}");
                }
                jobs.iter().for_each(print_job);
            }
            JobCommands::Get { name } => {
                let job: JobInfo = dealer
                    .fetch(dealer.client.get(dealer.url(&format!("/jobs/{ns}/{name}"))))
                    .await?;
                print_job(&job);
            }
            JobCommands::Create {
                name,
                function,
                version,
                tasks,
                max_allocation,
            } => {
                let req = job_create_request(&ns, name, function, version, tasks, max_allocation);
                let job: JobInfo = dealer
                    .fetch(dealer.client.post(dealer.url(&format!("/jobs/{ns}"))).json(&req))
                    .await?;
                println!("Job creado:");
                print_job(&job);
            }
            JobCommands::Update {
                name,
                tasks,
                max_allocation,
            } => {
                let url = dealer.url(&format!("/jobs/{ns}/{name}"));
                let job: JobInfo = dealer
                    .fetch(dealer.client.put(url).json(&job_patch(tasks, max_allocation)))
                    .await?;
                print_job(&job);
            }
            JobCommands::Delete { name } => {
                dealer
                    .send(dealer.client.delete(dealer.url(&format!("/jobs/{ns}/{name}"))))
                    .await?;
                println!("Job {name} borrado");
            }
        },
        Commands::Procs(cmd) => match cmd {
            ProcCommands::List => {
                let procs: Vec<ProcessMessage> = dealer
                    .fetch(dealer.client.get(dealer.url(&format!("/processes/{ns}"))))
                    .await?;
                if procs.is_empty() {
                    println!("No hay procesos en {ns}");
                }
                procs.iter().for_each(print_process);
            }
            ProcCommands::Get { name } => {
                let proc: ProcessMessage = dealer
                    .fetch(dealer.client.get(dealer.url(&format!("/processes/{ns}/{name}"))))
                    .await?;
                print_process(&proc);
            }
            ProcCommands::Delete { name } => {
                dealer
                    .send(dealer.client.delete(dealer.url(&format!("/processes/{ns}/{name}"))))
                    .await?;
                println!("Proceso {name} borrado");
            }
            ProcCommands::State { name, state } => {
                let url = dealer.url(&format!("/processes/{ns}/{name}/state"));
                let resp = dealer
                    .send(dealer.client.put(url).json(&json!({ "state": state })))
                    .await?;
                if resp.status() == StatusCode::NO_CONTENT {
                    println!("Proceso {name} desalojado");
                } else {
                    let proc: ProcessMessage = resp.json().await?;
                    print_process(&proc);
                }
            }
        },
        Commands::Deploys(cmd) => match cmd {
            DeployCommands::List => {
                let deps: Vec<DeploymentInfo> = dealer
                    .fetch(dealer.client.get(dealer.url(&format!("/deployments/{ns}"))))
                    .await?;
                deps.iter().for_each(print_deployment);
            }
            DeployCommands::Apply { file } => {
                let data = std::fs::read(&file)
                    .with_context(|| format!("no se pudo leer {}", file.display()))?;
                let mut spec: DeploymentSpec = serde_json::from_slice(&data)
                    .with_context(|| format!("{} no es un deployment válido", file.display()))?;
                if spec.namespace.is_empty() {
                    spec.namespace = ns.clone();
                }
                let url = dealer.url(&format!("/deployments/{}", spec.namespace));
                let dep: DeploymentInfo =
                    dealer.fetch(dealer.client.post(url).json(&spec)).await?;
                print_deployment(&dep);
            }
            DeployCommands::Remove { function, version } => {
                let url = dealer.url(&format!("/deployments/{ns}/{function}"));
                dealer
                    .send(dealer.client.delete(url).query(&[("version", version)]))
                    .await?;
                println!("Deployment {function} desactivado");
            }
        },
    }

    Ok(())
}
