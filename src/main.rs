// Licensed under the MIT License

//! `latticeflow` CLI (SPEC_FULL §2): `run` builds and drives a demo flow to
//! completion, `status` loads a snapshot and prints the node/status tree,
//! `resume` loads a snapshot and continues driving it.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use anyhow::Context;

use latticeflow::config::Config;
use latticeflow::error::{FlowError, Result};
use latticeflow::node::{Dependency, NodeId};
use latticeflow::workflow::Workflow;
use latticeflow::Flow;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ToplevelArgs::parse();
    if let Err(err) = args.exec() {
        tracing::error!(%err, "command failed");
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(name = "latticeflow", about = "Dependency-aware execution engine for DAGs of external scientific-compute jobs")]
struct ToplevelArgs {
    #[command(subcommand)]
    action: Action,
}

impl ToplevelArgs {
    fn exec(self) -> anyhow::Result<()> {
        match self.action {
            Action::Run(a) => a.exec().context("run failed"),
            Action::Status(a) => a.exec().context("status failed"),
            Action::Resume(a) => a.exec().context("resume failed"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Build and drive a demo flow to completion, then snapshot it.
    Run(RunArgs),
    /// Load a snapshot and print the node/status tree.
    Status(StatusArgs),
    /// Load a snapshot and continue driving it to completion.
    Resume(ResumeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Override the config's root working directory.
    #[arg(long)]
    workdir: Option<PathBuf>,
}

impl RunArgs {
    fn exec(self) -> Result<()> {
        let cfg = Config::load_default()?;
        let workdir = self.workdir.unwrap_or(cfg.workdir()?);

        let mut flow = Flow::new(workdir.clone(), cfg.manager_config());
        demo::register_callbacks(&mut flow);
        demo::build_demo(&mut flow)?;

        flow.run()?;
        latticeflow::persistence::dump(&flow)?;

        print_tree(&flow);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

impl StatusArgs {
    fn exec(self) -> Result<()> {
        let flow = latticeflow::persistence::load(&self.workdir)?;
        print_tree(&flow);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

impl ResumeArgs {
    fn exec(self) -> Result<()> {
        let mut flow = latticeflow::persistence::load(&self.workdir)?;
        demo::register_callbacks(&mut flow);
        flow.run()?;
        latticeflow::persistence::dump(&flow)?;
        print_tree(&flow);
        Ok(())
    }
}

fn print_tree(flow: &Flow) {
    for (i, wf) in flow.workflows.iter().enumerate() {
        println!("work_{i} [{}] {}", wf.id(), wf.core.status);
        for (j, task) in wf.tasks.iter().enumerate() {
            println!("  task_{j} [{}] {}", task.id(), task.core.status);
        }
    }
}

/// A minimal concrete flow + callback, standing in for the real
/// domain-specific workflows this engine would drive (e.g. an SCF -> NSCF
/// band-structure chain). Exists so `run`/`resume` have something real to
/// build and so `register_callback_fn` has a registered key to resolve
/// after a snapshot load.
mod demo {
    use super::*;

    pub fn register_callbacks(flow: &mut Flow) {
        flow.register_callback_fn("demo::spawn_followup", spawn_followup);
    }

    pub fn build_demo(flow: &mut Flow) -> Result<()> {
        let scf_id = flow.alloc_id();
        let nscf_id = flow.alloc_id();
        let mut wf = Workflow::new(flow.alloc_id());
        wf.register(
            scf_id,
            serde_json::json!({"deck": "scf"}),
            Vec::new(),
            vec!["DEN"],
            1,
        );
        wf.register(
            nscf_id,
            serde_json::json!({"deck": "nscf"}),
            vec![Dependency::new(scf_id, ["DEN"])],
            vec!["WFK"],
            1,
        );
        let wf_id = flow.register_work(wf, Vec::new())?;

        flow.register_callback(
            "demo::spawn_followup",
            vec![wf_id],
            serde_json::Value::Null,
        )?;
        Ok(())
    }

    /// Populate the callback's empty workflow with one more task once its
    /// upstream workflow reaches S_OK (spec §4.4: "just-in-time workflow
    /// synthesis").
    fn spawn_followup(flow: &mut Flow, work_id: NodeId, _user_data: &serde_json::Value) -> Result<()> {
        let idx = flow
            .workflows
            .iter()
            .position(|w| w.id() == work_id)
            .ok_or_else(|| FlowError::Config(format!("callback workflow {work_id} not found")))?;
        let id = flow.alloc_id();
        flow.workflows[idx].register(
            id,
            serde_json::json!({"deck": "followup"}),
            Vec::new(),
            Vec::<String>::new(),
            1,
        );
        Ok(())
    }
}
