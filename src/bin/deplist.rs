//! kiln-deplist: convert compiler dependency output into the deplist
//! database the build engine consults for discovered dependencies.

use anyhow::{anyhow, bail};
use kiln::{depfile, deplist, scanner::Scanner};
use std::io::Read;
use std::path::Path;

#[derive(argh::FromArgs)]
/// convert compiler dependency output into the kiln deplist database
struct Opts {
    /// input format; only "gcc" (Makefile-style .d output) is supported
    #[argh(option, short = 'f', default = "\"gcc\".to_string()")]
    format: String,

    /// deplist database file to update [default=.kiln_deps]
    #[argh(option, short = 'd', default = "\".kiln_deps\".to_string()")]
    database: String,

    /// record dependencies under this target index name instead of the
    /// depfile's own target names
    #[argh(option, short = 'o')]
    output: Option<String>,

    /// input file; reads stdin when omitted
    #[argh(positional)]
    input: Option<String>,
}

fn run() -> anyhow::Result<()> {
    let opts: Opts = argh::from_env();
    if opts.format != "gcc" {
        bail!("unknown input format '{}'", opts.format);
    }

    let mut content = match &opts.input {
        Some(path) => std::fs::read(path).map_err(|err| anyhow!("read {}: {}", path, err))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(|err| anyhow!("read stdin: {}", err))?;
            buf
        }
    };
    content.push(0);

    let mut scanner = Scanner::new(&content);
    let parsed = depfile::parse(&mut scanner).map_err(|err| {
        let name = opts.input.as_deref().unwrap_or("<stdin>");
        anyhow!(scanner.format_parse_error(Path::new(name), err))
    })?;

    let mut writer = deplist::open(&opts.database)?;
    for (target, deps) in parsed.iter() {
        let name = opts.output.as_deref().unwrap_or(*target);
        writer.write_deps(name, deps)?;
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("kiln-deplist: error: {}", err);
        std::process::exit(1);
    }
}
