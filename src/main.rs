use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use args::Args;
use getopts::Occur;
use glob::glob;
use log::info;
use memtrace::parse::{self, AllocationInfo, FunctionList};
use num_format::{Locale, ToFormattedString};

const PROGRAM_DESC: &str = "List heap allocations in memtrace logs and trace accesses to them";
const PROGRAM_NAME: &str = "mt_print";

fn read_allocations(path: &Path) -> Result<Vec<AllocationInfo>, anyhow::Error> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let allocations = parse::collect_allocations(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(allocations)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "f",
        "file",
        "Trace log, or a glob pattern matching several logs",
        "FILE",
        Occur::Req,
        None,
    );
    args.option(
        "w",
        "whitelist",
        "Skip allocations made under the functions listed in FILE (default: printf vprintf)",
        "FILE",
        Occur::Optional,
        None,
    );
    args.option(
        "t",
        "target",
        "Only list allocations made under the functions listed in FILE",
        "FILE",
        Occur::Optional,
        None,
    );
    args.option(
        "s",
        "select",
        "Show the N-th allocation of the list",
        "N",
        Occur::Optional,
        None,
    );
    args.option(
        "o",
        "output",
        "Write the accesses to the selected allocation to FILE",
        "FILE",
        Occur::Optional,
        None,
    );
    args.flag("y", "yaml", "Print the allocation list as YAML");

    args.parse_from_cli()?;

    let pattern: String = args.value_of("file")?;
    let whitelist = match args.optional_value_of::<String>("whitelist")? {
        Some(path) => FunctionList::load(Path::new(&path))?,
        None => FunctionList::default_whitelist(),
    };
    let targets = match args.optional_value_of::<String>("target")? {
        Some(path) => Some(FunctionList::load(Path::new(&path))?),
        None => None,
    };

    // (log, allocation) pairs, numbered from 1 in the listing.
    let mut candidates: Vec<(PathBuf, AllocationInfo)> = vec![];
    for path in glob(pattern.as_str())? {
        let path = path?;
        info!("reading trace log {}", path.display());
        let mut allocations = parse::filter_whitelisted(read_allocations(&path)?, &whitelist);
        if let Some(targets) = &targets {
            allocations = parse::select_targets(allocations, targets);
        }
        candidates.extend(allocations.into_iter().map(|info| (path.clone(), info)));
    }
    if candidates.is_empty() {
        bail!("no allocations found in {}", pattern);
    }

    if args.value_of::<bool>("yaml")? {
        let allocations: Vec<&AllocationInfo> = candidates.iter().map(|(_, info)| info).collect();
        print!("{}", serde_yaml::to_string(&allocations)?);
        return Ok(());
    }

    let selected = match args.optional_value_of::<usize>("select")? {
        Some(index) => index,
        None => {
            println!("Allocation Information :");
            for (index, (path, info)) in candidates.iter().enumerate() {
                println!(
                    " -[{:>2}] {:#x}\t{} B\t{}\t({})",
                    index + 1,
                    info.address,
                    info.size.to_formatted_string(&Locale::en),
                    info.origin().unwrap_or("???"),
                    path.display()
                );
            }
            return Ok(());
        }
    };
    let (path, info) = selected
        .checked_sub(1)
        .and_then(|i| candidates.get(i))
        .ok_or_else(|| anyhow!("no allocation number {}", selected))?;

    match args.optional_value_of::<String>("output")? {
        Some(output) => {
            let input = BufReader::new(File::open(path)?);
            let out = File::create(&output).with_context(|| format!("failed to create {}", output))?;
            let accesses = parse::trace_allocation(input, BufWriter::new(out), info)?;
            eprintln!(
                "{} accesses to {:#x} written to {}",
                accesses.to_formatted_string(&Locale::en),
                info.address,
                output
            );
        }
        None => {
            println!("{:#x}\t({}, line {})", info.address, path.display(), info.line);
            println!("Size: {}", info.size.to_formatted_string(&Locale::en));
            for (i, frame) in info.stack.iter().enumerate() {
                println!("{} {}", if i == 0 { "at" } else { "by" }, frame);
            }
        }
    }

    Ok(())
}
