use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    Ack, ConfigFragment, CreateGroupRequest, ErrorResponse, GroupStatus, OperatorKind,
    OperatorRequest, TaskEventRequest, TopologyShape,
};
use reqwest::{Client, Response};
use std::env;

/// Igual que en el worker:
/// - En Docker: DRIVER_URL=http://driver:8080
/// - Local: default http://localhost:8080
fn driver_base_url() -> String {
    env::var("DRIVER_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para administrar grupos en el driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crea un grupo con los operadores del job de ejemplo
    CreateGroup {
        #[arg(value_name = "GRUPO")]
        group: String,

        /// Task raíz de todos los operadores
        #[arg(long)]
        root: String,

        /// Miembros esperados separados por coma (la raíz se agrega sola)
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Árbol con este fan-out; sin el flag se elige según el tamaño
        #[arg(long)]
        fan_out: Option<usize>,

        /// Fuerza topología plana
        #[arg(long, conflicts_with = "fan_out")]
        flat: bool,
    },
    /// Consulta topología, epoch y acks de un grupo
    Status {
        #[arg(value_name = "GRUPO")]
        group: String,
    },
    /// Reporta un task como caído
    Fail {
        #[arg(value_name = "GRUPO")]
        group: String,

        #[arg(value_name = "TASK_ID")]
        task: String,

        #[arg(long, default_value = "reportado desde el CLI")]
        reason: String,
    },
}

/// Operadores que usa el worker de ejemplo.
fn demo_operators(root: &str) -> Vec<OperatorRequest> {
    let op = |name: &str, kind: OperatorKind, fragments: Vec<ConfigFragment>| OperatorRequest {
        name: name.to_string(),
        kind,
        root: root.to_string(),
        fragments,
    };
    vec![
        op("model", OperatorKind::Broadcast, vec![]),
        op("shards", OperatorKind::Scatter, vec![]),
        op(
            "sum",
            OperatorKind::Reduce,
            vec![ConfigFragment::reduce_function("sum")],
        ),
        op("results", OperatorKind::Gather, vec![]),
    ]
}

/// Falla con el mensaje `{ "error": ... }` del driver si la respuesta no es 2xx.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ErrorResponse>().await {
        Ok(body) => bail!("el driver respondió {}: {}", status, body.error),
        Err(_) => bail!("el driver respondió {}", status),
    }
}

fn print_status(status: &GroupStatus) {
    println!("Grupo:");
    println!("  id: {}", status.group_id);
    println!("  estado: {:?}", status.state);
    println!("  epoch: {}", status.epoch);
    println!("  raíz: {}", status.root_id);
    println!("  operadores: {}", status.operators.join(", "));
    println!("  actualizado: {}", status.updated_at);
    println!("Miembros:");
    for member in &status.members {
        let acked = member
            .acked_epoch
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<16} {:<10} padre={:<12} hijos=[{}] intentos={} ack={}",
            member.task_id,
            format!("{:?}", member.status),
            member.parent_id.as_deref().unwrap_or("-"),
            member.child_ids.join(","),
            member.attempts,
            acked
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = driver_base_url();

    match cli.command {
        Commands::CreateGroup {
            group,
            root,
            members,
            fan_out,
            flat,
        } => {
            let shape = if flat {
                Some(TopologyShape::Flat)
            } else {
                fan_out.map(|fan_out| TopologyShape::Tree { fan_out })
            };
            let req = CreateGroupRequest {
                group_id: group,
                members,
                shape,
                operators: demo_operators(&root),
            };

            let url = format!("{}/api/v1/groups", base_url);
            let resp = check(client.post(&url).json(&req).send().await?).await?;
            let status: GroupStatus = resp.json().await?;
            print_status(&status);
        }
        Commands::Status { group } => {
            let url = format!("{}/api/v1/groups/{}", base_url, group);
            let resp = check(client.get(&url).send().await?).await?;
            let status: GroupStatus = resp.json().await?;
            print_status(&status);
        }
        Commands::Fail {
            group,
            task,
            reason,
        } => {
            let url = format!("{}/api/v1/groups/{}/tasks/failed", base_url, group);
            let req = TaskEventRequest {
                task_id: task.clone(),
                reason: Some(reason),
            };
            let resp = check(client.post(&url).json(&req).send().await?).await?;
            let _: Ack = resp.json().await?;
            println!("task {} de {} marcado como caído", task, group);
        }
    }

    Ok(())
}
