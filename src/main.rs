use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fs;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidal::codegen::printer::print_program;
use tidal::compiler::compile_file;
use tidal::error::CompileError;
use tidal::options::{CompileOptions, ParallelizationOption};
use tidal::runtime::Value;
use tidal::simulator::Simulation;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tidal=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cli() -> Command {
    Command::new("tidal")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compiles and runs time-stepped simulation models")
        .arg(
            Arg::new("input")
                .help("Model source file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("max-time")
                .long("max-time")
                .value_name("N")
                .help("Run the model for N ticks")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Compile options as JSON"),
        )
        .arg(
            Arg::new("set")
                .long("set")
                .value_name("NAME=VALUE")
                .help("Value of an external parameter")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("emit-ir")
                .long("emit-ir")
                .help("Print the lowered program")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the lowered program to FILE"),
        )
        .arg(
            Arg::new("parallel")
                .long("parallel")
                .value_name("MODE")
                .help("Where parallel execution is allowed")
                .value_parser(["none", "arrays", "code", "all"]),
        )
        .arg(
            Arg::new("no-cache")
                .long("no-cache")
                .help("Disable stage slot and parameter caching")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("N")
                .help("Seed for the random built-ins")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("print-stage")
                .long("print-stage")
                .value_name("NAME")
                .help("Stage to include in the run summary")
                .action(ArgAction::Append),
        )
}

fn load_options(matches: &ArgMatches) -> Result<CompileOptions, CompileError> {
    let mut options = match matches.get_one::<String>("config") {
        Some(path) => CompileOptions::from_json_file(path)?,
        None => CompileOptions::default(),
    };
    if let Some(mode) = matches.get_one::<String>("parallel") {
        options.parallelization_option = match mode.as_str() {
            "none" => ParallelizationOption::None,
            "arrays" => ParallelizationOption::InInitializingArray,
            "code" => ParallelizationOption::InParallelSpecifiedCode,
            _ => ParallelizationOption::All,
        };
    }
    if matches.get_flag("no-cache") {
        options.cache_stages = false;
        options.cache_parameters = false;
    }
    if let Some(output) = matches.get_one::<String>("output") {
        options.generate_in_memory = false;
        options.output_assembly = Some(output.into());
    }
    Ok(options)
}

fn parse_assignment(text: &str) -> Result<(&str, Value), CompileError> {
    let Some((name, value)) = text.split_once('=') else {
        return Err(CompileError::Usage(format!("expected NAME=VALUE, found '{}'", text)));
    };
    let value = value.trim();
    let value = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match value.parse::<i64>() {
            Ok(int) => Value::Int64(int),
            Err(_) => value
                .parse::<f64>()
                .map(Value::Float64)
                .map_err(|_| CompileError::Usage(format!("'{}' is not a number", value)))?,
        },
    };
    Ok((name.trim(), value))
}

fn run() -> Result<(), CompileError> {
    let matches = cli().get_matches();

    let input = matches
        .get_one::<String>("input")
        .ok_or_else(|| CompileError::Usage("missing input file".to_string()))?;
    let options = load_options(&matches)?;

    let compilation = compile_file(input, &options)?;
    if !compilation.diagnostics.is_empty() {
        eprint!("{}", compilation.diagnostics);
    }
    let program = compilation.into_result()?;

    let listing = print_program(&program);
    if let Some(path) = options.output_path() {
        fs::write(path, &listing)?;
        info!(path = %path.display(), "wrote lowered program");
    }
    if matches.get_flag("emit-ir") {
        print!("{}", listing);
    }

    let Some(&max_time) = matches.get_one::<usize>("max-time") else {
        return Ok(());
    };

    let mut simulation = Simulation::new(Arc::new(program));
    if let Some(&seed) = matches.get_one::<u64>("seed") {
        simulation = simulation.with_seed(seed);
    }
    for assignment in matches.get_many::<String>("set").into_iter().flatten() {
        let (name, value) = parse_assignment(assignment)?;
        simulation.set_parameter(name, value)?;
    }
    simulation.simulate(max_time, &[])?;

    let requested: Vec<String> = match matches.get_many::<String>("print-stage") {
        Some(names) => names.cloned().collect(),
        None => simulation
            .program()
            .stages
            .iter()
            .map(|stage| stage.name.clone())
            .collect(),
    };
    let mut stages = serde_json::Map::new();
    for name in requested {
        let value = simulation.stage_at(&name, max_time as i64)?;
        stages.insert(name, serde_json::to_value(value)?);
    }
    let summary = serde_json::json!({
        "max_time": max_time,
        "stages": stages,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
