use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use track2vec::{EntityKind, Vectors};

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Track,
    Artist,
    Genre,
}

impl From<Kind> for EntityKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Track => EntityKind::Track,
            Kind::Artist => EntityKind::Artist,
            Kind::Genre => EntityKind::Genre,
        }
    }
}

#[derive(Parser)]
#[command(about = "Interactively list the entries closest to a set of ids", long_about = None)]
struct Options {
    /// Vector file written by track2vec, e.g. track_vec.json
    #[arg(value_name = "FILE")]
    file_name: PathBuf,

    /// Kind of entity stored in FILE
    #[arg(long, value_enum, default_value_t = Kind::Track)]
    kind: Kind,

    /// Number of closest entries to show
    #[arg(short = 'n', long, default_value_t = 40)]
    top: usize,
}

fn run(options: &Options) -> Result<()> {
    let vectors = Vectors::load(&options.file_name, options.kind.into())
        .with_context(|| format!("error loading {}", options.file_name.display()))?;
    println!("{} vectors of size {}", vectors.len(), vectors.size());

    'outer: loop {
        print!("Enter ids separated by spaces (EXIT to break): ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).context("error reading stdin")? == 0 {
            break;
        }
        let line = line.trim();
        if line == "EXIT" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let mut query = vec![];
        for id in line.split_whitespace() {
            match vectors.lookup(id) {
                None => {
                    println!("{id}: not found");
                    continue 'outer;
                }
                Some(i) => {
                    println!("{id}: position {i}");
                    query.push(i);
                }
            }
        }

        println!();
        println!("{:>50}       Cosine similarity", vectors.kind().to_string());
        println!("------------------------------------------------------------------------");
        for (id, similarity) in vectors.nearest(&query, options.top) {
            println!("{id:>50}\t\t{similarity}");
        }
    }
    Ok(())
}

fn main() {
    let options = Options::parse();
    if let Err(err) = run(&options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
