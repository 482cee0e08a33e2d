//! Command-line surface: argument structs and dispatch to the coordinator.

use crate::app::{App, DisplayOptions, GeometryOptions, Instance, UploadOptions};
use crate::cache::{CacheFormat, Constraint};
use crate::config::dump_config;
use crate::formula;
use crate::geometry::parse_size;
use crate::id::database::{ImageRecord, ListQuery, UploadState};
use crate::id::space::{IdSpace, IdSubspace};
use crate::term::placeholder::RestoreCursor;
use crate::term::transport::Transport;
use crate::utils::time::{format_us, time_ago};
use crate::utils::{IkupError, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "ikup", version, about = "Display images in Kitty-protocol terminals")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Display an image (the default command).
    Display(DisplayArgs),
    /// Upload an image without displaying it.
    Upload(UploadArgs),
    /// Assign an id to an image without uploading or displaying it.
    #[command(name = "get-id")]
    GetId(GetIdArgs),
    /// Print a placeholder for a known id.
    Placeholder(PlaceholderArgs),
    /// List known images matching the query.
    List(ForeachArgs),
    /// Reupload matching images whose status is not up to date.
    Fix(ForeachArgs),
    /// Unconditionally reupload matching images.
    Reupload(ForeachArgs),
    /// Mark matching images as not uploaded to any terminal.
    Dirty(ForeachArgs),
    /// Forget matching images (ids are removed from the database).
    Forget(ForeachArgs),
    /// Manage the transcode cache.
    Cache(CacheArgs),
    /// Show identity, database and cache status.
    Status,
    /// Print the effective configuration as TOML.
    #[command(name = "dump-config")]
    DumpConfig,
    /// Purge old databases and trim the cache.
    Cleanup,
}

#[derive(Args, Debug, Default, Clone)]
pub struct GeometryArgs {
    /// Number of columns to fit the image to.
    #[arg(short = 'c', long)]
    pub cols: Option<u32>,

    /// Number of rows to fit the image to.
    #[arg(short = 'r', long)]
    pub rows: Option<u32>,

    /// Cell box as "CxR" (formulas over tr/tc are allowed).
    #[arg(long = "box", value_name = "CxR")]
    pub box_spec: Option<String>,

    /// Maximum number of columns for automatically computed boxes.
    #[arg(long)]
    pub max_cols: Option<u32>,

    /// Maximum number of rows for automatically computed boxes.
    #[arg(long)]
    pub max_rows: Option<u32>,

    /// Scale factor for automatically computed boxes.
    #[arg(short = 's', long)]
    pub scale: Option<f32>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct IdArgs {
    /// Force this exact id; a colliding binding is stolen.
    #[arg(long, value_parser = parse_id_value)]
    pub force_id: Option<u32>,

    /// Id space for automatically assigned ids.
    #[arg(long)]
    pub id_space: Option<IdSpace>,

    /// High-byte range BEGIN:END for automatically assigned ids.
    #[arg(long)]
    pub id_subspace: Option<IdSubspace>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct UploadFlagArgs {
    /// Upload method: file, stream or direct.
    #[arg(short = 'm', long)]
    pub upload_method: Option<Transport>,

    /// Allow uploads concurrent with other processes.
    #[arg(long, value_name = "auto|true|false")]
    pub allow_concurrent_uploads: Option<String>,

    /// Mark the image uploaded afterwards (false leaves it dirty).
    #[arg(long, value_name = "true|false")]
    pub mark_uploaded: Option<String>,

    /// File or pipe for graphics commands instead of /dev/tty.
    #[arg(short = 'O', long, value_name = "FILE")]
    pub out_command: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct DisplayFlagArgs {
    /// File or pipe for placeholder output instead of stdout.
    #[arg(short = 'o', long, value_name = "FILE")]
    pub out_display: Option<PathBuf>,

    /// Absolute position "X,Y" (formulas over tr/tc/cx/cy/ec/er).
    #[arg(long, value_name = "X,Y")]
    pub pos: Option<String>,

    /// Save/restore the cursor around the image.
    #[arg(long, default_value = "auto", value_name = "true|false|auto")]
    pub restore_cursor: RestoreCursor,

    /// Use line feeds instead of cursor movement between rows.
    #[arg(long, default_value = "auto", value_name = "auto|true|false")]
    pub use_line_feeds: String,
}

#[derive(Args, Debug)]
pub struct DisplayArgs {
    /// Image files or known ids ("id:1234", "0xABC").
    pub images: Vec<String>,

    #[command(flatten)]
    pub geometry: GeometryArgs,

    #[command(flatten)]
    pub id: IdArgs,

    /// Force (re)upload even if already uploaded.
    #[arg(short = 'f', long, conflicts_with = "no_upload")]
    pub force_upload: bool,

    /// Only assign the id and print the placeholder.
    #[arg(short = 'n', long)]
    pub no_upload: bool,

    #[command(flatten)]
    pub upload: UploadFlagArgs,

    #[command(flatten)]
    pub display: DisplayFlagArgs,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Image files or known ids ("id:1234", "0xABC").
    pub images: Vec<String>,

    #[command(flatten)]
    pub geometry: GeometryArgs,

    #[command(flatten)]
    pub id: IdArgs,

    /// Force (re)upload even if already uploaded.
    #[arg(short = 'f', long)]
    pub force_upload: bool,

    #[command(flatten)]
    pub upload: UploadFlagArgs,
}

#[derive(Args, Debug)]
pub struct GetIdArgs {
    /// Image files.
    pub images: Vec<String>,

    #[command(flatten)]
    pub geometry: GeometryArgs,

    #[command(flatten)]
    pub id: IdArgs,
}

#[derive(Args, Debug)]
pub struct PlaceholderArgs {
    /// The image id ("1234", "id:1234" or "0xABC").
    pub id: String,

    /// Number of columns of the placeholder.
    #[arg(short = 'c', long, required = true)]
    pub cols: u32,

    /// Number of rows of the placeholder.
    #[arg(short = 'r', long, required = true)]
    pub rows: u32,

    #[command(flatten)]
    pub display: DisplayFlagArgs,
}

#[derive(Args, Debug)]
pub struct ForeachArgs {
    /// Image files or known ids ("id:1234", "0xABC").
    pub images: Vec<String>,

    /// Affect all known images explicitly.
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Affect only the N most recently used images.
    #[arg(short = 'l', long, value_name = "N")]
    pub last: Option<usize>,

    /// Print according to FORMAT (%i %x %c %r %p %P %m %a %D).
    #[arg(short = 'p', long, value_name = "FORMAT")]
    pub print: Option<String>,

    /// Show details and a preview for each image.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Do not print affected image ids.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Maximum preview columns in verbose mode.
    #[arg(long)]
    pub max_cols: Option<u32>,

    /// Maximum preview rows in verbose mode.
    #[arg(long)]
    pub max_rows: Option<u32>,

    #[command(flatten)]
    pub display: DisplayFlagArgs,

    #[command(flatten)]
    pub upload: UploadFlagArgs,
}

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Args, Debug, Default, Clone)]
pub struct CacheConstraintArgs {
    /// Target width in pixels.
    #[arg(long)]
    pub width: Option<u32>,

    /// Target height in pixels.
    #[arg(long)]
    pub height: Option<u32>,

    /// Target size as "WxH".
    #[arg(long, value_name = "WxH")]
    pub size: Option<String>,

    /// Target format: png or jpeg.
    #[arg(long)]
    pub format: Option<CacheFormat>,

    /// JPEG quality (advisory for png).
    #[arg(long)]
    pub quality: Option<u8>,

    /// Maximum encoded size in bytes.
    #[arg(long)]
    pub max_bytes: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Convert an image, caching (and reusing) the result.
    Convert {
        source: PathBuf,
        #[command(flatten)]
        constraint: CacheConstraintArgs,
    },
    /// Look up a cached conversion without encoding.
    Check {
        source: PathBuf,
        #[command(flatten)]
        constraint: CacheConstraintArgs,
    },
    /// List cached conversions, optionally for one source.
    List { source: Option<PathBuf> },
    /// Remove cached conversions of a source.
    Remove {
        source: PathBuf,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        format: Option<CacheFormat>,
    },
    /// Remove every cached conversion.
    Purge,
    /// Show cache statistics.
    Status,
    /// Evict old entries and sweep temp files.
    Cleanup,
}

// ---- helpers ----

/// Parse an id of the forms "1234", "0xABC" or "id:...".
pub fn parse_as_id(text: &str) -> Option<u32> {
    let text = text.strip_prefix("id:").unwrap_or(text);
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_id_value(text: &str) -> std::result::Result<u32, String> {
    parse_as_id(text).ok_or_else(|| format!("invalid id: '{}'", text))
}

fn parse_bool_flag(value: &Option<String>, name: &str) -> Result<Option<bool>> {
    match value.as_deref() {
        None | Some("auto") => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(other) => Err(IkupError::invalid_arg(format!(
            "invalid --{} value '{}'",
            name, other
        ))),
    }
}

fn line_feed_mode(value: &str) -> Result<Option<bool>> {
    match value {
        "auto" => Ok(None),
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        other => Err(IkupError::invalid_arg(format!(
            "invalid --use-line-feeds value '{}'",
            other
        ))),
    }
}

/// Resolve a `--box` argument into cols/rows, allowing formulas over the
/// terminal size.
fn resolve_box(app: &App, spec: &str) -> Result<(u32, u32)> {
    let (term_cols, term_rows) = app.writer.terminal_size().unwrap_or((
        app.config.fallback_max_cols,
        app.config.fallback_max_rows,
    ));
    let vars = move |name: &str| -> Option<f64> {
        match name {
            "tc" => Some(term_cols as f64),
            "tr" => Some(term_rows as f64),
            _ => None,
        }
    };
    let text = spec.replace('x', ",");
    let (cols, rows) = formula::eval_pair(&text, &vars)?;
    if cols < 1.0 || rows < 1.0 {
        return Err(IkupError::invalid_arg(format!(
            "box must be at least 1x1: '{}'",
            spec
        )));
    }
    Ok((cols.round() as u32, rows.round() as u32))
}

fn geometry_options(app: &App, args: &GeometryArgs) -> Result<GeometryOptions> {
    let mut options = GeometryOptions {
        cols: args.cols,
        rows: args.rows,
        max_cols: args.max_cols,
        max_rows: args.max_rows,
        scale: args.scale,
    };
    if let Some(spec) = &args.box_spec {
        if args.cols.is_some() || args.rows.is_some() {
            return Err(IkupError::invalid_arg(
                "--box conflicts with --cols/--rows",
            ));
        }
        let (cols, rows) = resolve_box(app, spec)?;
        options.cols = Some(cols);
        options.rows = Some(rows);
    }
    Ok(options)
}

fn upload_options(id: &IdArgs, flags: &UploadFlagArgs, force_upload: bool) -> Result<UploadOptions> {
    Ok(UploadOptions {
        force_id: id.force_id,
        id_space: id.id_space,
        id_subspace: id.id_subspace,
        force_upload,
        upload_method: flags.upload_method,
        allow_concurrent_uploads: parse_bool_flag(
            &flags.allow_concurrent_uploads,
            "allow-concurrent-uploads",
        )?,
        mark_uploaded: parse_bool_flag(&flags.mark_uploaded, "mark-uploaded")?,
    })
}

fn display_options(flags: &DisplayFlagArgs) -> Result<DisplayOptions> {
    Ok(DisplayOptions {
        position: flags.pos.clone(),
        restore_cursor: flags.restore_cursor,
        use_line_feeds: line_feed_mode(&flags.use_line_feeds)?,
    })
}

/// Format one record with a printf-like format string.
pub fn format_record(format: &str, _space: IdSpace, record: &ImageRecord) -> Result<String> {
    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('e') => out.push('\x1b'),
                other => {
                    return Err(IkupError::invalid_arg(format!(
                        "unknown escape sequence \\{}",
                        other.map(String::from).unwrap_or_default()
                    )))
                }
            },
            '%' => match chars.next() {
                Some('%') => out.push('%'),
                Some('i') => out.push_str(&record.id.to_string()),
                Some('x') => out.push_str(&format!("{:08x}", record.id)),
                Some('c') => out.push_str(&record.cols.to_string()),
                Some('r') => out.push_str(&record.rows.to_string()),
                Some('p') | Some('P') => out.push_str(&record.path.to_string_lossy()),
                Some('m') => out.push_str(&format_us(record.mtime_ns / 1000)),
                Some('a') => out.push_str(&format_us(record.atime_us)),
                Some('D') => out.push_str(&record.fingerprint),
                other => {
                    return Err(IkupError::invalid_arg(format!(
                        "unknown format specifier %{}",
                        other.map(String::from).unwrap_or_default()
                    )))
                }
            },
            other => out.push(other),
        }
    }
    Ok(out)
}

// ---- command execution ----

/// Streams a command's explicit output redirections, for App construction.
pub fn output_paths(command: &Command) -> (Option<PathBuf>, Option<PathBuf>) {
    match command {
        Command::Display(args) => (
            args.upload.out_command.clone(),
            args.display.out_display.clone(),
        ),
        Command::Upload(args) => (args.upload.out_command.clone(), None),
        Command::Placeholder(args) => (None, args.display.out_display.clone()),
        Command::List(args) | Command::Fix(args) | Command::Reupload(args)
        | Command::Dirty(args) | Command::Forget(args) => (
            args.upload.out_command.clone(),
            args.display.out_display.clone(),
        ),
        _ => (None, None),
    }
}

pub fn run(app: &mut App, command: Command) -> Result<()> {
    match command {
        Command::Display(args) => run_display(app, args),
        Command::Upload(args) => run_upload(app, args),
        Command::GetId(args) => run_get_id(app, args),
        Command::Placeholder(args) => run_placeholder(app, args),
        Command::List(args) => run_foreach(app, Foreach::List, args),
        Command::Fix(args) => run_foreach(app, Foreach::Fix, args),
        Command::Reupload(args) => run_foreach(app, Foreach::Reupload, args),
        Command::Dirty(args) => run_foreach(app, Foreach::Dirty, args),
        Command::Forget(args) => run_foreach(app, Foreach::Forget, args),
        Command::Cache(args) => run_cache(app, args.command),
        Command::Status => run_status(app),
        Command::DumpConfig => {
            print!("{}", dump_config(&app.config));
            Ok(())
        }
        Command::Cleanup => {
            let removed = app.cleanup()?;
            for path in removed {
                println!("Removed old database: {}", path.display());
            }
            Ok(())
        }
    }
}

/// Resolve one image argument to an instance, assigning an id when the
/// argument is a path.
fn resolve_image(
    app: &mut App,
    image: &str,
    geometry: &GeometryOptions,
    options: &UploadOptions,
) -> Result<Instance> {
    if !Path::new(image).exists() {
        if let Some(id) = parse_as_id(image) {
            if options.force_id.is_some() {
                return Err(IkupError::invalid_arg(
                    "cannot use --force-id together with an id argument",
                ));
            }
            return app.instance_by_id(id)?.ok_or_else(|| {
                IkupError::invalid_arg(format!("id is not assigned or assignment is broken: {}", id))
            });
        }
    }
    app.assign_id(Path::new(image), geometry, options)
}

fn check_force_id_multi(images: &[String], options: &UploadOptions) -> Result<()> {
    if images.len() > 1 && options.force_id.is_some() {
        return Err(IkupError::invalid_arg(
            "cannot use --force-id with multiple images",
        ));
    }
    Ok(())
}

fn run_display(app: &mut App, args: DisplayArgs) -> Result<()> {
    let geometry = geometry_options(app, &args.geometry)?;
    let options = upload_options(&args.id, &args.upload, args.force_upload)?;
    let display = display_options(&args.display)?;
    check_force_id_multi(&args.images, &options)?;
    let mut errors = false;
    for image in &args.images {
        let result = resolve_image(app, image, &geometry, &options).and_then(|instance| {
            if !args.no_upload {
                app.upload_instance(&instance, &options)?;
            }
            app.display_instance(&instance, &display)
        });
        if let Err(err) = result {
            errors = true;
            eprintln!("error: failed to display {}: {}", image, err);
        }
    }
    if errors {
        std::process::exit(1);
    }
    Ok(())
}

fn run_upload(app: &mut App, args: UploadArgs) -> Result<()> {
    let geometry = geometry_options(app, &args.geometry)?;
    let options = upload_options(&args.id, &args.upload, args.force_upload)?;
    check_force_id_multi(&args.images, &options)?;
    let mut errors = false;
    for image in &args.images {
        let result = resolve_image(app, image, &geometry, &options)
            .and_then(|instance| app.upload_instance(&instance, &options));
        if let Err(err) = result {
            errors = true;
            eprintln!("error: failed to upload {}: {}", image, err);
        }
    }
    if errors {
        std::process::exit(1);
    }
    Ok(())
}

fn run_get_id(app: &mut App, args: GetIdArgs) -> Result<()> {
    let geometry = geometry_options(app, &args.geometry)?;
    let options = upload_options(&args.id, &UploadFlagArgs::default(), false)?;
    check_force_id_multi(&args.images, &options)?;
    for image in &args.images {
        let instance = resolve_image(app, image, &geometry, &options)?;
        println!("{}", instance.id);
    }
    Ok(())
}

fn run_placeholder(app: &mut App, args: PlaceholderArgs) -> Result<()> {
    let id = parse_as_id(&args.id)
        .ok_or_else(|| IkupError::invalid_arg(format!("invalid id: '{}'", args.id)))?;
    let space = IdSpace::from_id(id)?;
    let display = display_options(&args.display)?;
    app.print_placeholder(id, space, args.cols, args.rows, &display)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Foreach {
    List,
    Fix,
    Reupload,
    Dirty,
    Forget,
}

fn foreach_query(app: &mut App, args: &ForeachArgs, default_all: bool) -> Result<(Vec<(IdSpace, ImageRecord)>, bool)> {
    let query_given = args.all || args.last.is_some();
    if args.all && (args.last.is_some() || !args.images.is_empty()) {
        return Err(IkupError::invalid_arg(
            "--all cannot be combined with images or other queries",
        ));
    }
    if !query_given && args.images.is_empty() {
        if default_all {
            let (records, _) = app.resolve_query(&ListQuery::All)?;
            return Ok((records, false));
        }
        return Err(IkupError::invalid_arg(
            "specify images/ids, a query, or --all",
        ));
    }
    if let Some(n) = args.last {
        let (records, _) = app.resolve_query(&ListQuery::Last(n))?;
        return Ok((records, false));
    }
    if args.all {
        let (records, _) = app.resolve_query(&ListQuery::All)?;
        return Ok((records, false));
    }
    let mut ids = Vec::new();
    let mut paths = Vec::new();
    for image in &args.images {
        if !Path::new(image).exists() {
            if let Some(id) = parse_as_id(image) {
                ids.push(id);
                continue;
            }
        }
        paths.push(crate::id::fingerprint::normalize_path(Path::new(image)));
    }
    let mut errors = false;
    let mut records = Vec::new();
    if !ids.is_empty() {
        let (found, missing) = app.resolve_query(&ListQuery::Ids(ids))?;
        for m in &missing {
            eprintln!("error: not found in the database: {}", m);
            errors = true;
        }
        records.extend(found);
    }
    if !paths.is_empty() {
        let (found, missing) = app.resolve_query(&ListQuery::Paths(paths))?;
        for m in &missing {
            eprintln!("error: not found in the database: {}", m);
            errors = true;
        }
        records.extend(found);
    }
    records.sort_by_key(|(_, r)| r.atime_us);
    Ok((records, errors))
}

fn run_foreach(app: &mut App, action: Foreach, args: ForeachArgs) -> Result<()> {
    let display = display_options(&args.display)?;
    let (records, mut errors) = foreach_query(app, &args, action == Foreach::List)?;

    for (space, record) in &records {
        match action {
            Foreach::List => {}
            Foreach::Forget => app.forget(*space, record.id)?,
            Foreach::Dirty => app.mark_dirty(*space, record.id)?,
            Foreach::Fix => {
                match app.fix_record(*space, record) {
                    Ok(_uploaded) => {}
                    Err(err) => {
                        eprintln!("error: failed to fix {}: {}", record.id, err);
                        errors = true;
                        continue;
                    }
                }
            }
            Foreach::Reupload => {
                if let Err(err) = app.reupload_record(*space, record) {
                    eprintln!("error: failed to reupload {}: {}", record.id, err);
                    errors = true;
                    continue;
                }
            }
        }

        if args.quiet {
            continue;
        }
        let line = match &args.print {
            Some(format) => format_record(format, *space, record)?,
            None => format_record("%i\t%cx%r\t%P", *space, record)?,
        };
        if args.verbose && action == Foreach::List {
            print_verbose_record(app, *space, record, &args, &display)?;
        } else if action == Foreach::List {
            app.writer.write_display(format!("{}\n", line).as_bytes())?;
        } else {
            let verb = match action {
                Foreach::Fix => "fix",
                Foreach::Reupload => "reupload",
                Foreach::Dirty => "dirty",
                Foreach::Forget => "forget",
                Foreach::List => unreachable!(),
            };
            app.writer
                .write_display(format!("{} {}\n", verb, line).as_bytes())?;
        }
    }
    app.writer.flush()?;
    if errors {
        std::process::exit(1);
    }
    Ok(())
}

fn print_verbose_record(
    app: &mut App,
    space: IdSpace,
    record: &ImageRecord,
    args: &ForeachArgs,
    display: &DisplayOptions,
) -> Result<()> {
    let id = record.id;
    let subspace_byte = space.high_byte(id);
    let mut out = String::new();
    out.push_str(&format!(
        "\x1b[1mID: {}\x1b[0m = {:#010x} id_space: {} subspace_byte: {} = {:#04x} atime: {} ({})\n",
        id,
        id,
        space,
        subspace_byte,
        subspace_byte,
        format_us(record.atime_us),
        time_ago(record.atime_us),
    ));
    out.push_str(&format!("  {}\n", record.fingerprint));
    if app.needs_uploading(space, record)? {
        out.push_str(&format!(
            "  \x1b[1mNEEDS UPLOADING\x1b[0m to {}\n",
            app.identity.terminal_id
        ));
    }
    for upload in app.upload_rows(space, id)? {
        out.push_str("  ");
        if upload.description != record.fingerprint {
            out.push_str("(Needs reuploading) ");
        }
        let (verb, when) = match &upload.state {
            UploadState::Uploaded { at_us, .. } => ("Uploaded to", *at_us),
            UploadState::InProgress {
                last_progress_at_us,
                ..
            } => ("Uploading in progress to", *last_progress_at_us),
            UploadState::Dirty { .. } => ("Dirty in", record.atime_us),
        };
        out.push_str(&format!(
            "{} {} via {} at {} ({})  size: {} bytes",
            verb,
            upload.terminal_id,
            upload.transport,
            format_us(when),
            time_ago(when),
            upload.size_bytes,
        ));
        if let UploadState::Uploaded {
            uploads_ago,
            bytes_ago,
            ..
        } = &upload.state
        {
            out.push_str(&format!(
                " bytes_ago: {} uploads_ago: {}",
                bytes_ago, uploads_ago
            ));
        }
        out.push('\n');
        if upload.description != record.fingerprint {
            out.push_str(&format!("    INVALID DESCRIPTION: {}\n", upload.description));
        }
    }
    app.writer.write_display(out.as_bytes())?;

    // A cropped preview of the image itself.
    let max_cols = args.max_cols.unwrap_or(app.config.fallback_max_cols);
    let max_rows = args.max_rows.unwrap_or(4);
    let cols = record.cols.min(max_cols).max(1);
    let rows = record.rows.min(max_rows).max(1);
    app.print_placeholder(id, space, cols, rows, display)?;
    if record.cols > max_cols || record.rows > max_rows {
        app.writer.write_display(
            format!("  Note: cropped to {}x{}\n", cols, rows).as_bytes(),
        )?;
    }
    let dashes = "-".repeat(max_cols.min(80) as usize);
    app.writer.write_display(format!("{}\n", dashes).as_bytes())?;
    Ok(())
}

fn cache_constraint(args: &CacheConstraintArgs) -> Result<Constraint> {
    let mut constraint = Constraint {
        width: args.width,
        height: args.height,
        max_bytes: args.max_bytes,
        format: args.format,
        quality: args.quality,
    };
    if let Some(size) = &args.size {
        if constraint.width.is_some() || constraint.height.is_some() {
            return Err(IkupError::invalid_arg("--size conflicts with --width/--height"));
        }
        let (w, h) = parse_size(size)?;
        constraint.width = Some(w);
        constraint.height = Some(h);
    }
    constraint.validate()?;
    Ok(constraint)
}

fn run_cache(app: &mut App, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Convert { source, constraint } => {
            let constraint = cache_constraint(&constraint)?;
            let hit = app.cache.convert(&source, &constraint)?;
            if hit.impossible {
                eprintln!(
                    "warning: even the 1x1 image exceeds {} bytes",
                    constraint.max_bytes.unwrap_or_default()
                );
            }
            println!("{}", hit.entry.path.display());
        }
        CacheCommand::Check { source, constraint } => {
            let constraint = cache_constraint(&constraint)?;
            match app.cache.check(&source, &constraint)? {
                Some(hit) => {
                    if hit.impossible {
                        eprintln!(
                            "warning: even the 1x1 image exceeds {} bytes",
                            constraint.max_bytes.unwrap_or_default()
                        );
                    }
                    println!("{}", hit.entry.path.display());
                }
                None => {
                    println!("no entry");
                    std::process::exit(1);
                }
            }
        }
        CacheCommand::List { source } => {
            for entry in app.cache.list(source.as_deref())? {
                println!(
                    "{}\t{}x{}\t{}\t{} bytes\t{}",
                    entry.path.display(),
                    entry.width,
                    entry.height,
                    entry.format,
                    entry.byte_size,
                    time_ago(entry.atime_us),
                );
            }
        }
        CacheCommand::Remove {
            source,
            width,
            height,
            format,
        } => {
            let removed = app.cache.remove(&source, width, height, format)?;
            println!("Removed {} cached conversions", removed);
        }
        CacheCommand::Purge => {
            let removed = app.cache.purge()?;
            println!("Removed {} cached files", removed);
        }
        CacheCommand::Status => {
            let status = app.cache.status()?;
            println!("Cache directory: {}", status.directory.display());
            println!("Entries: {} (max {})", status.count, status.max_images);
            println!(
                "Total size: {} bytes (max {})",
                status.total_bytes, status.max_total_bytes
            );
        }
        CacheCommand::Cleanup => {
            let removed = app.cache.cleanup()?;
            println!("Evicted {} cached conversions", removed);
        }
    }
    Ok(())
}

fn run_status(app: &mut App) -> Result<()> {
    println!("terminal_name: {}", app.identity.terminal_name);
    println!("terminal_id: {}", app.identity.terminal_id);
    println!("session_id: {}", app.identity.session_id);
    println!("Default id space: {}", app.default_space()?);
    println!("Default id subspace: {}", app.default_subspace()?);
    let (max_cols, max_rows) = app.max_cols_and_rows(&GeometryOptions::default())?;
    println!("Max size in cells (cols x rows): {} x {}", max_cols, max_rows);
    let (cell_w, cell_h) = app.cell_size()?;
    println!("(Assumed) cell size in pixels (w x h): {} x {}", cell_w, cell_h);
    let status = app.cache.status()?;
    println!(
        "Cache: {} entries, {} bytes in {}",
        status.count,
        status.total_bytes,
        status.directory.display()
    );

    println!("\nDatabases in {}:", app.config.id_database_dir);
    let mut files: Vec<(PathBuf, i64, u64)> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&app.config.id_database_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0);
            files.push((path, mtime, meta.len()));
        }
    }
    files.sort_by_key(|&(_, mtime, _)| std::cmp::Reverse(mtime));
    for (path, mtime, size) in files {
        println!(
            "  {}  (mtime: {}, size: {} KiB)",
            path.display(),
            format_us(mtime),
            size / 1024
        );
    }
    Ok(())
}

// ---- multi-command splitting ----

const COMMAND_NAMES: &[&str] = &[
    "display",
    "upload",
    "get-id",
    "placeholder",
    "list",
    "fix",
    "reupload",
    "dirty",
    "forget",
    "cache",
    "status",
    "dump-config",
    "cleanup",
    "help",
];

/// Split raw arguments on literal `:` tokens into independent command
/// argument lists; each runs against the same App.
pub fn split_multi_commands(args: &[String]) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for arg in args {
        if arg == ":" {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(arg.clone());
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// The default command is `display`: prepend it when the first token is
/// neither a known command nor a help/version request.
pub fn normalize_command_args(mut args: Vec<String>) -> Vec<String> {
    let known = args
        .iter()
        .any(|a| COMMAND_NAMES.contains(&a.as_str()));
    let wants_help = args
        .iter()
        .any(|a| a == "-h" || a == "--help" || a == "-V" || a == "--version");
    if !known && !wants_help && !args.is_empty() {
        args.insert(0, "display".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_as_id() {
        assert_eq!(parse_as_id("1234"), Some(1234));
        assert_eq!(parse_as_id("0x123456"), Some(0x123456));
        assert_eq!(parse_as_id("id:42"), Some(42));
        assert_eq!(parse_as_id("id:0x2a"), Some(0x2A));
        assert_eq!(parse_as_id("wikipedia.png"), None);
    }

    #[test]
    fn test_format_record() {
        let record = ImageRecord {
            id: 0x123456,
            fingerprint: "cafebabe".to_string(),
            path: PathBuf::from("/tmp/tux.png"),
            mtime_ns: 0,
            size_bytes: 10,
            cols: 4,
            rows: 2,
            format: None,
            quality: None,
            variant_max_bytes: None,
            atime_us: 0,
        };
        let line = format_record("%i %x %cx%r %P %D", IdSpace::Bits24, &record).unwrap();
        assert_eq!(line, "1193046 00123456 4x2 /tmp/tux.png cafebabe");
        let escaped = format_record("%i\\t%%\\n", IdSpace::Bits24, &record).unwrap();
        assert_eq!(escaped, "1193046\t%\n");
        assert!(format_record("%z", IdSpace::Bits24, &record).is_err());
        assert!(format_record("\\q", IdSpace::Bits24, &record).is_err());
    }

    #[test]
    fn test_split_multi_commands() {
        let args: Vec<String> = ["display", "a.png", ":", "list", "-v"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let chunks = split_multi_commands(&args);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], vec!["display", "a.png"]);
        assert_eq!(chunks[1], vec!["list", "-v"]);
    }

    #[test]
    fn test_normalize_command_args() {
        let args = normalize_command_args(vec!["tux.png".to_string(), "-r".to_string(), "2".to_string()]);
        assert_eq!(args[0], "display");
        let args = normalize_command_args(vec!["list".to_string()]);
        assert_eq!(args[0], "list");
        let args = normalize_command_args(vec!["--help".to_string()]);
        assert_eq!(args[0], "--help");
    }

    #[test]
    fn test_display_flag_conflict() {
        use clap::Parser;
        let result = Cli::try_parse_from(["ikup", "display", "a.png", "-f", "-n"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cache_constraint_args() {
        let args = CacheConstraintArgs {
            size: Some("32x16".to_string()),
            ..Default::default()
        };
        let constraint = cache_constraint(&args).unwrap();
        assert_eq!(constraint.width, Some(32));
        assert_eq!(constraint.height, Some(16));
        let bad = CacheConstraintArgs {
            size: Some("32x16".to_string()),
            width: Some(8),
            ..Default::default()
        };
        assert!(cache_constraint(&bad).is_err());
    }
}
