use std::io::{self, BufRead, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use varmat::cli::Cli;
use varmat::ingest::IngestOptions;
use varmat::store::disk::DiskVariations;
use varmat::store::VariationStore;
use varmat::vcf::{open_vcf, MaxFieldLens, VcfOptions, VcfParser};

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    cli.validate()?;

    let reader: Box<dyn BufRead> = match cli.input.as_deref() {
        None | Some("-") => Box::new(BufReader::new(io::stdin())),
        Some(path) => open_vcf(std::path::Path::new(path))
            .with_context(|| format!("Failed to open VCF input {path}"))?,
    };

    let options = VcfOptions {
        pre_read_max_size: Some(cli.pre_read_max_size),
        kept_fields: cli.kept_fields.clone(),
        ignored_fields: cli.ignored_fields.clone(),
        max_field_lens: MaxFieldLens {
            alt: cli.alt_gt_num,
            ..MaxFieldLens::default()
        },
        n_workers: (cli.threads > 1).then_some(cli.threads),
        ..VcfOptions::default()
    };
    let mut parser =
        VcfParser::from_reader(reader, options).context("Failed to parse the VCF header")?;

    let mut store = DiskVariations::create_with_chunk_size(&cli.output, cli.chunk_size)
        .with_context(|| format!("Failed to create output store {}", cli.output))?;

    let log = store
        .put_vars(
            &mut parser,
            IngestOptions {
                chunk_size: cli.chunk_size,
                ignore_alt: cli.ignore_alt,
                ..IngestOptions::default()
            },
        )
        .context("Failed while storing variations")?;

    info!(
        "stored {} variations in {}",
        log.variations_processed, cli.output
    );
    if log.skipped_wide_alt > 0 {
        info!(
            "skipped {} variations with more than {} alternate alleles",
            log.skipped_wide_alt,
            cli.alt_gt_num.unwrap_or(0)
        );
    }
    Ok(())
}
