//! Command line front-end for executing operation pipelines on
//! observation products.

mod format;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tropo_pipeline::ExecutionEngine;
use tropo_product::{ArrayData, Product, Variable};

/// Execute an operation pipeline on an observation product
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "tropo")]
struct Cli {
    /// Path to the input product document (JSON)
    #[arg(value_name = "INPUT", required_unless_present = "list_derivations")]
    input: Option<PathBuf>,

    /// Semicolon-separated operations to execute, e.g. "t>15;keep(t*)"
    #[arg(short = 'a', long, value_name = "OPERATIONS")]
    operations: Option<String>,

    /// Semicolon-separated engine options, e.g. "afgl86=usstd76"
    #[arg(short = 'o', long, value_name = "OPTIONS")]
    options: Option<String>,

    /// Print variable metadata instead of a summary
    #[arg(short, long)]
    list: bool,

    /// Print variable data values
    #[arg(short, long)]
    data: bool,

    /// Write the result product to this path
    #[arg(long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// List the variable derivations the engine supports and exit
    #[arg(long)]
    list_derivations: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(args) {
        eprintln!("ERROR: {error:#}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<()> {
    if args.list_derivations {
        print_derivations();
        return Ok(());
    }

    let input = args.input.as_deref().expect("clap enforces INPUT");
    let mut product = format::load_product(input)?;
    info!(
        source = ?product.source_product,
        variables = product.num_variables(),
        "loaded product"
    );

    let engine =
        ExecutionEngine::new().with_dataset_resolver(Box::new(format::JsonDatasetResolver));

    // Engine options apply before any operation runs.
    if let Some(options) = &args.options {
        for entry in options.split(';').filter(|s| !s.trim().is_empty()) {
            let (option, value) = entry.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("option '{entry}' is not of the form name=value")
            })?;
            tropo_pipeline::options::apply_set(option.trim(), value.trim())?;
        }
    }

    if let Some(operations) = &args.operations {
        engine.execute_operations(&mut product, operations)?;
    }

    if product.is_empty() {
        eprintln!("WARNING: result product is empty");
    }

    if args.list {
        print_variable_list(&product);
    } else if args.data {
        print_data(&product);
    } else {
        print_summary(&product);
    }

    if let Some(output) = &args.output {
        format::save_product(&product, output)?;
        info!(path = %output.display(), "wrote result product");
    }

    Ok(())
}

fn format_dims(variable: &Variable) -> String {
    if variable.num_dims() == 0 {
        return "scalar".to_string();
    }
    let parts: Vec<String> = variable
        .dims
        .iter()
        .map(|(dimension_type, length)| format!("{dimension_type}={length}"))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

fn print_summary(product: &Product) {
    match &product.source_product {
        Some(source) => println!("source product: {source}"),
        None => println!("source product: (unset)"),
    }
    println!("dimensions:");
    for (dimension_type, length) in product.dimensions() {
        println!("    {dimension_type} = {length}");
    }
    println!("variables: {}", product.num_variables());
    for variable in product.variables() {
        let unit = variable
            .unit
            .as_deref()
            .map(|u| format!(" [{u}]"))
            .unwrap_or_default();
        println!(
            "    {} {} {}{}",
            variable.data_type(),
            variable.name,
            format_dims(variable),
            unit
        );
    }
}

fn print_variable_list(product: &Product) {
    for variable in product.variables() {
        println!("{} {} {}", variable.data_type(), variable.name, format_dims(variable));
        if let Some(unit) = &variable.unit {
            println!("    unit: {unit}");
        }
        if let (Some(min), Some(max)) = (variable.valid_min, variable.valid_max) {
            println!("    valid range: [{}, {}]", min.as_f64(), max.as_f64());
        }
        if !variable.enum_names.is_empty() {
            println!("    enumeration: {}", variable.enum_names.join(", "));
        }
        if let Some(description) = &variable.description {
            println!("    description: {description}");
        }
    }
}

fn print_data(product: &Product) {
    for variable in product.variables() {
        print!("{} =", variable.name);
        match &variable.data {
            ArrayData::Str(values) => {
                for value in values {
                    match value {
                        Some(text) => print!(" \"{text}\""),
                        None => print!(" null"),
                    }
                }
            }
            data => {
                for i in 0..data.len() {
                    match data.get_f64(i) {
                        Ok(value) => print!(" {value}"),
                        Err(_) => print!(" ?"),
                    }
                }
            }
        }
        println!();
    }
}

fn print_derivations() {
    println!("supported derivations:");
    println!("    index {{time}} -- row enumeration of the time dimension");
    println!("    <variable> {{time, ...}} -- broadcast of a variable lacking the time axis");
    println!("    <variable> [unit] -- unit conversion of an existing variable");
    println!("    <variable> <data type> -- data type conversion of an existing variable");
}
