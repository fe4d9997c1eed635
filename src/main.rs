use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, LevelFilter, debug, error, info, warn};
use serde::Serialize;
use tokio_stream::StreamExt;

use rnaseq_pipelines::cli::{parse, Arguments};
use rnaseq_pipelines::config::defs::{PipelineError, RunConfig};
use rnaseq_pipelines::config::references::ReferenceCatalog;
use rnaseq_pipelines::config::settings::PipelineSettings;
use rnaseq_pipelines::pipelines::enrichment::convert_gmt;
use rnaseq_pipelines::pipelines::events::{BroadcastPublisher, Topic};
use rnaseq_pipelines::pipelines::orchestrator::{CancelToken, PipelineOrchestrator};
use rnaseq_pipelines::store::{
    ArtifactFilter, ArtifactRegistry, JsonFileStore, NewProject, ProjectStore, SequencingLayout,
};
use rnaseq_pipelines::utils::command::check_version;
use rnaseq_pipelines::utils::fastx::sample_name;
use rnaseq_pipelines::utils::gtf::preprocess_gff;
use rnaseq_pipelines::utils::system::detect_cores;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n RNA-seq Pipelines\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let store = Arc::new(JsonFileStore::open(&absolute(&dir, &args.store))?);
    let module = args.module.clone();

    if let Err(e) = match module.as_str() {
        "rnaseq" => rnaseq_run(&args, &dir, store).await,
        "status" => status_run(&args, store.as_ref()),
        "artifacts" => artifacts_run(&args, store.as_ref()),
        "links" => links_run(&args, &dir),
        "annotation" => annotation_run(&args, &dir),
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Submits (or reruns) a project and drives it to a terminal status,
/// printing every status event as one JSON line.
async fn rnaseq_run(args: &Arguments, cwd: &Path, store: Arc<JsonFileStore>) -> Result<(), PipelineError> {
    let config = Arc::new(build_run_config(args, cwd)?);
    check_tools(&config.settings).await;

    let publisher = Arc::new(BroadcastPublisher::new(config.settings.event_buffer));
    let orchestrator = PipelineOrchestrator::new(config.clone(), store.clone(), store.clone(), publisher.clone());

    let project_id = match args.project {
        Some(id) => {
            info!("Rerunning project {}", id);
            id
        }
        None => {
            let metadata = args
                .metadata
                .as_ref()
                .ok_or_else(|| PipelineError::InvalidInput("--metadata is required for a new project".to_string()))?;
            let reads: Vec<PathBuf> = args.inputs.iter().map(|i| absolute(cwd, i)).collect();
            let layout: SequencingLayout = args.layout.into();
            let name = match (&args.name, reads.first()) {
                (Some(name), _) => name.clone(),
                (None, Some(first)) => sample_name(first, layout),
                (None, None) => return Err(PipelineError::InvalidInput("at least one -i input is required".to_string())),
            };
            let new = NewProject {
                session_id: args.session.clone(),
                name,
                species: args.species.to_lowercase(),
                genome_reference: config.references.genome_label(&args.species),
                pipeline_version: args.pipeline_version.clone(),
                sequencing_type: layout,
                pvalue_cutoff: args.pvalue_cutoff,
            };
            orchestrator.submit(new, &reads, &absolute(cwd, metadata))?.id
        }
    };

    let subscription = publisher.subscribe(Topic::Project(project_id));
    let printer = tokio::spawn(async move {
        let mut events = std::pin::pin!(subscription.into_stream());
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialise event: {}", e),
            }
            if event.status.is_terminal() {
                break;
            }
        }
    });

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator.run(project_id, Some(cancel)).await;
    // Closing the channel ends the printer if no terminal event was sent.
    drop(orchestrator);
    drop(publisher);
    if let Err(e) = printer.await {
        debug!("Event printer stopped: {}", e);
    }

    let project = result?;
    info!("Project {} finished as {}", project.id, project.status);
    Ok(())
}


fn status_run(args: &Arguments, store: &JsonFileStore) -> Result<(), PipelineError> {
    let projects = match args.project {
        Some(id) => vec![store.get_project(id)?],
        None => store.list_projects(Some(&args.session))?,
    };
    if projects.is_empty() {
        info!("No projects in session {}", args.session);
    }
    for project in projects {
        println!("{}", json_line(&project)?);
    }
    Ok(())
}


fn artifacts_run(args: &Arguments, store: &JsonFileStore) -> Result<(), PipelineError> {
    let project_id = args
        .project
        .ok_or_else(|| PipelineError::InvalidInput("--project is required for the artifacts module".to_string()))?;
    store.get_project(project_id)?;
    for artifact in store.query(project_id, &ArtifactFilter::default())? {
        println!(
            "{}\t{}\t{}\t{}",
            artifact.kind,
            artifact.file_format,
            artifact.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            artifact.path.display()
        );
    }
    Ok(())
}


/// Converts GMT gene set files into `converted_links/<name>_links.csv` tables
/// next to each input.
fn links_run(args: &Arguments, cwd: &Path) -> Result<(), PipelineError> {
    for gmt in module_inputs(args, cwd)? {
        let dir = gmt.parent().unwrap_or(cwd).join("converted_links");
        std::fs::create_dir_all(&dir)?;
        let out = dir.join(format!("{}_links.csv", plain_stem(&gmt)));
        let rows = convert_gmt(&gmt, &out)?;
        info!("{} terms linked in {}", rows, out.display());
    }
    Ok(())
}


/// Writes `<name>.processed.gff3` beside each GFF3 input, with exons tagged by gene.
fn annotation_run(args: &Arguments, cwd: &Path) -> Result<(), PipelineError> {
    for gff in module_inputs(args, cwd)? {
        let out = gff.with_file_name(format!("{}.processed.gff3", plain_stem(&gff)));
        let tagged = preprocess_gff(&gff, &out)?;
        info!("Tagged {} exons from {}", tagged, gff.display());
    }
    Ok(())
}


fn plain_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}


fn module_inputs(args: &Arguments, cwd: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if args.inputs.is_empty() {
        return Err(PipelineError::InvalidInput(format!("module {} needs at least one -i input", args.module)));
    }
    Ok(args.inputs.iter().map(|i| absolute(cwd, i)).collect())
}


/// Settings file, reference catalog and thread count, resolved once.
fn build_run_config(args: &Arguments, cwd: &Path) -> Result<RunConfig, PipelineError> {
    let settings = match &args.config {
        Some(path) => PipelineSettings::load(&absolute(cwd, path))?,
        None => PipelineSettings::default(),
    };
    let references = ReferenceCatalog::load(&settings.references_root, settings.references_file.as_deref())?;
    debug!("Reference catalog species: {}", references.species_names().join(", "));

    let threads = detect_cores(args.threads.unwrap_or(settings.threads));
    debug!("Using {} threads for external tools", threads);

    Ok(RunConfig { settings, references: Arc::new(references), threads })
}


/// Logs each tool's version; a missing tool only warns here and fails later
/// in the stage that needs it.
async fn check_tools(settings: &PipelineSettings) {
    for (tag, program) in settings.required_tools() {
        match check_version(tag, program).await {
            Ok(version) => info!("{} version: {}", tag, version),
            Err(e) => warn!("{} not usable: {}", tag, e),
        }
    }
}


fn json_line<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(|e| PipelineError::Other(e.into()))
}


fn absolute(cwd: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}
