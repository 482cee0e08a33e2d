//! The image-instance coordinator: glue between the ID database, the
//! transcode cache, the transports and the placeholder renderer.

use crate::cache::{CacheFormat, Constraint, TranscodeCache};
use crate::config::Config;
use crate::formula;
use crate::geometry::{fit_cell_box, parse_size, BoxConstraints};
use crate::id::database::{
    purge_stale_databases, AssignPolicy, IdDatabase, ImageRecord, ListQuery, NewInstance,
    UploadRow, UploadState,
};
use crate::id::fingerprint::{instance_fingerprint, normalize_path, FormatParams};
use crate::id::space::{IdSpace, IdSubspace};
use crate::term::command::Format;
use crate::term::identity::TerminalIdentity;
use crate::term::placeholder::{self, PlaceholderOptions, RestoreCursor};
use crate::term::transport::{self, Transport, UploadParams};
use crate::term::writer::TerminalWriter;
use crate::utils::time::{mtime_ns, now_us};
use crate::utils::{IkupError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Geometry-related per-operation overrides.
#[derive(Debug, Clone, Default)]
pub struct GeometryOptions {
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub max_cols: Option<u32>,
    pub max_rows: Option<u32>,
    pub scale: Option<f32>,
}

/// Upload-related per-operation overrides.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub force_id: Option<u32>,
    pub id_space: Option<IdSpace>,
    pub id_subspace: Option<IdSubspace>,
    pub force_upload: bool,
    pub upload_method: Option<Transport>,
    pub allow_concurrent_uploads: Option<bool>,
    pub mark_uploaded: Option<bool>,
}

/// Display-related per-operation overrides.
#[derive(Debug, Clone, Default)]
pub struct DisplayOptions {
    /// `X,Y` formula pair for absolute positioning.
    pub position: Option<String>,
    pub restore_cursor: RestoreCursor,
    /// None means auto: line feeds when the display stream is not a tty
    /// and no position was given.
    pub use_line_feeds: Option<bool>,
}

/// An assigned image instance, ready for upload or display.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    pub space: IdSpace,
    pub fingerprint: String,
    pub path: PathBuf,
    pub mtime_ns: i64,
    pub size_bytes: u64,
    pub cols: u32,
    pub rows: u32,
    pub variant_max_bytes: Option<u64>,
}

impl Instance {
    fn from_record(record: &ImageRecord, space: IdSpace) -> Instance {
        Instance {
            id: record.id,
            space,
            fingerprint: record.fingerprint.clone(),
            path: record.path.clone(),
            mtime_ns: record.mtime_ns,
            size_bytes: record.size_bytes,
            cols: record.cols,
            rows: record.rows,
            variant_max_bytes: record.variant_max_bytes,
        }
    }

    /// The source file still exists unchanged.
    pub fn is_file_available(&self) -> bool {
        self.path.exists() && mtime_ns(&self.path) == self.mtime_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    /// Status is up to date; nothing to send.
    Skip,
    /// Another process is uploading and making progress; trust it.
    Wait,
    Upload,
}

pub struct ReuploadLimits {
    pub max_uploads_ago: i64,
    pub max_bytes_ago: u64,
    pub max_seconds_ago: i64,
}

/// The upload decision table. `fingerprint` is the instance we want the
/// terminal to have.
pub fn decide_upload(
    status: Option<&UploadRow>,
    fingerprint: &str,
    force: bool,
    allow_concurrent: bool,
    stall_timeout: Duration,
    limits: &ReuploadLimits,
    now: i64,
) -> UploadDecision {
    if force {
        return UploadDecision::Upload;
    }
    let row = match status {
        None => return UploadDecision::Upload,
        Some(row) => row,
    };
    if row.description != fingerprint {
        return UploadDecision::Upload;
    }
    match &row.state {
        UploadState::Dirty { .. } => UploadDecision::Upload,
        UploadState::Uploaded {
            at_us,
            uploads_ago,
            bytes_ago,
            ..
        } => {
            let age_s = (now - at_us) / 1_000_000;
            if *uploads_ago > limits.max_uploads_ago
                || *bytes_ago > limits.max_bytes_ago
                || age_s > limits.max_seconds_ago
            {
                UploadDecision::Upload
            } else {
                UploadDecision::Skip
            }
        }
        UploadState::InProgress {
            last_progress_at_us,
            ..
        } => {
            let stalled = now - last_progress_at_us > stall_timeout.as_micros() as i64;
            if stalled {
                UploadDecision::Upload
            } else if allow_concurrent {
                UploadDecision::Upload
            } else {
                UploadDecision::Wait
            }
        }
    }
}

pub struct App {
    pub config: Config,
    pub identity: TerminalIdentity,
    pub cache: TranscodeCache,
    pub writer: TerminalWriter,
    databases: HashMap<IdSpace, IdDatabase>,
}

impl App {
    pub fn new(
        config: Config,
        out_command: Option<&Path>,
        out_display: Option<&Path>,
    ) -> Result<App> {
        let identity = TerminalIdentity::resolve(&config);
        log::debug!(
            "Terminal identity: name={} id={} session={}",
            identity.terminal_name,
            identity.terminal_id,
            identity.session_id
        );
        let cache = TranscodeCache::new(
            Path::new(&config.cache_dir),
            config.thumbnail_file_size_tolerance,
            config.max_cached_images,
            config.max_cache_size_bytes,
            config.cache_cleanup_target,
        )?;
        let writer = TerminalWriter::open(out_command, out_display)?;
        Ok(App {
            config,
            identity,
            cache,
            writer,
            databases: HashMap::new(),
        })
    }

    // ---- configuration resolution ----

    pub fn default_space(&self) -> Result<IdSpace> {
        self.config.id_space.parse()
    }

    pub fn default_subspace(&self) -> Result<IdSubspace> {
        self.config.id_subspace.parse()
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.db_lock_timeout_ms)
    }

    pub fn database(&mut self, space: IdSpace) -> Result<&mut IdDatabase> {
        if !self.databases.contains_key(&space) {
            let db = IdDatabase::open(
                Path::new(&self.config.id_database_dir),
                &self.identity.session_id,
                space,
                self.lock_timeout(),
            )?;
            self.databases.insert(space, db);
        }
        Ok(self.databases.get_mut(&space).expect("just inserted"))
    }

    /// Spaces whose database file already exists for this identity, plus
    /// the configured default. Cross-space queries iterate these.
    fn known_spaces(&self) -> Result<Vec<IdSpace>> {
        let dir = Path::new(&self.config.id_database_dir);
        let mut spaces = Vec::new();
        for space in IdSpace::ALL {
            let path = dir.join(format!("{}-{}.db", self.identity.session_id, space.name()));
            if path.exists() || self.databases.contains_key(&space) {
                spaces.push(space);
            }
        }
        let default = self.default_space()?;
        if !spaces.contains(&default) {
            spaces.push(default);
        }
        Ok(spaces)
    }

    pub fn cell_size(&self) -> Result<(u32, u32)> {
        if self.config.cell_size == "auto" {
            if let Some(size) = self.writer.cell_size() {
                return Ok(size);
            }
            return parse_size(&self.config.default_cell_size);
        }
        parse_size(&self.config.cell_size)
    }

    fn auto_or_u32(value: &str, name: &str) -> Result<Option<u32>> {
        if value == "auto" {
            return Ok(None);
        }
        value
            .parse::<u32>()
            .map(Some)
            .map_err(|_| IkupError::invalid_arg(format!("invalid {} value '{}'", name, value)))
    }

    pub fn max_cols_and_rows(&self, geometry: &GeometryOptions) -> Result<(u32, u32)> {
        let mut max_cols = geometry.max_cols;
        let mut max_rows = geometry.max_rows;
        if max_cols.is_none() {
            max_cols = Self::auto_or_u32(&self.config.max_cols, "max_cols")?;
        }
        if max_rows.is_none() {
            max_rows = Self::auto_or_u32(&self.config.max_rows, "max_rows")?;
        }
        if max_cols.is_none() || max_rows.is_none() {
            match self.writer.terminal_size() {
                Some((cols, rows)) => {
                    max_cols = max_cols.or(Some(cols));
                    max_rows = max_rows.or(Some(rows.min(256)));
                }
                None => {
                    max_cols = max_cols.or(Some(self.config.fallback_max_cols));
                    max_rows = max_rows.or(Some(self.config.fallback_max_rows));
                }
            }
        }
        let cols = max_cols.unwrap_or(1).max(1);
        let rows = max_rows.unwrap_or(1).clamp(1, 256);
        Ok((cols, rows))
    }

    fn resolve_transport(&self, options: &UploadOptions) -> Result<Transport> {
        if let Some(transport) = options.upload_method {
            return Ok(transport);
        }
        if self.config.upload_method == "auto" {
            let inside_ssh = ["SSH_CLIENT", "SSH_TTY", "SSH_CONNECTION"]
                .iter()
                .any(|name| std::env::var_os(name).is_some());
            return Ok(if inside_ssh {
                Transport::Stream
            } else {
                Transport::File
            });
        }
        self.config.upload_method.parse()
    }

    fn allow_concurrent_uploads(&self, options: &UploadOptions) -> bool {
        if let Some(allow) = options.allow_concurrent_uploads {
            return allow;
        }
        match self.config.allow_concurrent_uploads.as_str() {
            "true" => true,
            "false" => false,
            // Terminals of the st family handle interleaved uploads.
            _ => self.identity.terminal_name.starts_with("st"),
        }
    }

    fn supported_formats(&self) -> Vec<CacheFormat> {
        if self.config.supported_formats == "auto" {
            let mut formats = vec![CacheFormat::Png];
            if self.identity.terminal_name.starts_with("st") {
                formats.push(CacheFormat::Jpeg);
            }
            formats
        } else {
            self.config
                .supported_formats
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect()
        }
    }

    fn reupload_limits(&self) -> ReuploadLimits {
        ReuploadLimits {
            max_uploads_ago: self.config.reupload_max_uploads_ago,
            max_bytes_ago: self.config.reupload_max_bytes_ago,
            max_seconds_ago: self.config.reupload_max_seconds_ago,
        }
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.upload_stall_timeout.max(0.0))
    }

    fn progress_interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.upload_progress_update_interval.max(0.01))
    }

    // ---- assign ----

    /// Compute the instance for a source image at its final cell box and
    /// assign (or reuse) an id for it.
    pub fn assign_id(
        &mut self,
        image: &Path,
        geometry: &GeometryOptions,
        options: &UploadOptions,
    ) -> Result<Instance> {
        // Opportunistic cleanup, so long-lived setups stay bounded without
        // a cron job.
        if rand::thread_rng().gen_bool(self.config.cleanup_probability.clamp(0.0, 1.0)) {
            if let Err(err) = self.cleanup() {
                log::warn!("Probabilistic cleanup failed: {}", err);
            }
        }

        let path = normalize_path(image);
        if !path.exists() {
            return Err(IkupError::path_gone(path.display().to_string()));
        }
        let (cols, rows) = if let (Some(cols), Some(rows)) = (geometry.cols, geometry.rows) {
            (cols, rows.min(256))
        } else {
            let (width, height) = image::image_dimensions(&path)?;
            let (max_cols, max_rows) = self.max_cols_and_rows(geometry)?;
            let scale =
                geometry.scale.unwrap_or(self.config.scale) * self.config.global_scale;
            fit_cell_box(
                width,
                height,
                &BoxConstraints {
                    cols: geometry.cols,
                    rows: geometry.rows,
                    max_cols,
                    max_rows,
                    cell_size: self.cell_size()?,
                    scale: scale as f64,
                },
            )?
        };

        let mtime = mtime_ns(&path);
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let fingerprint =
            instance_fingerprint(&path, mtime, size_bytes, cols, rows, &FormatParams::default());
        let new_instance = NewInstance {
            fingerprint: fingerprint.hex(),
            path: path.clone(),
            mtime_ns: mtime,
            size_bytes,
            cols,
            rows,
            format: None,
            quality: None,
        };

        let (space, policy) = match options.force_id {
            Some(id) => (IdSpace::from_id(id)?, AssignPolicy::ForceId(id)),
            None => {
                let space = match options.id_space {
                    Some(space) => space,
                    None => self.default_space()?,
                };
                let subspace = match options.id_subspace {
                    Some(subspace) => subspace,
                    None => self.default_subspace()?,
                };
                let max_num_ids = self.config.max_num_ids;
                (
                    space,
                    AssignPolicy::Default {
                        subspace,
                        max_num_ids,
                    },
                )
            }
        };
        let id = self.database(space)?.assign(&new_instance, &policy)?;
        log::info!("Assigned id {} ({:#010x}) to {}", id, id, path.display());
        Ok(Instance {
            id,
            space,
            fingerprint: new_instance.fingerprint,
            path,
            mtime_ns: mtime,
            size_bytes,
            cols,
            rows,
            variant_max_bytes: None,
        })
    }

    /// Look up an already assigned id across the known spaces.
    pub fn instance_by_id(&mut self, id: u32) -> Result<Option<Instance>> {
        let space = IdSpace::from_id(id)?;
        let record = self.database(space)?.get(id)?;
        Ok(record.map(|r| Instance::from_record(&r, space)))
    }

    // ---- upload ----

    /// Upload the instance if the per-terminal status says it is needed.
    pub fn upload_instance(&mut self, instance: &Instance, options: &UploadOptions) -> Result<()> {
        let transport = self.resolve_transport(options)?;
        if transport == Transport::Temp {
            return Err(IkupError::transport("temp"));
        }
        let force = options.force_upload || self.config.force_upload;
        let allow_concurrent = self.allow_concurrent_uploads(options);
        let limits = self.reupload_limits();
        let stall_timeout = self.stall_timeout();
        let poll = self.progress_interval();
        let terminal_id = self.identity.terminal_id.clone();

        loop {
            let status = self
                .database(instance.space)?
                .status(&terminal_id, instance.id)?;
            match decide_upload(
                status.as_ref(),
                &instance.fingerprint,
                force,
                allow_concurrent,
                stall_timeout,
                &limits,
                now_us(),
            ) {
                UploadDecision::Skip => {
                    log::debug!("Id {} is already uploaded to {}", instance.id, terminal_id);
                    return Ok(());
                }
                UploadDecision::Wait => {
                    log::debug!(
                        "Id {} is being uploaded by another process, waiting",
                        instance.id
                    );
                    std::thread::sleep(poll);
                }
                UploadDecision::Upload => break,
            }
        }
        self.transmit(instance, transport, options)
    }

    /// The unconditional transmit step: encode within the transport's byte
    /// cap, stream the bytes out, and publish the status transitions.
    fn transmit(
        &mut self,
        instance: &Instance,
        transport: Transport,
        options: &UploadOptions,
    ) -> Result<()> {
        let (data, capped) = self.prepare_payload(instance, transport)?;
        let terminal_id = self.identity.terminal_id.clone();

        if let Some(cap) = capped {
            self.database(instance.space)?
                .record_variant(instance.id, cap)?;
        }
        self.database(instance.space)?.mark_in_progress(
            &terminal_id,
            instance.id,
            transport.name(),
            &instance.fingerprint,
            data.len() as u64,
            now_us(),
        )?;

        let params = UploadParams {
            id: instance.id,
            cols: instance.cols,
            rows: instance.rows,
            format: Format::Png,
            chunk_size: self.config.chunk_size,
            command_delay: Duration::from_secs_f64(self.config.upload_command_delay.max(0.0)),
        };
        let interval = self.progress_interval();
        let mut last_update = std::time::Instant::now();

        self.database(instance.space)?;
        let result = {
            let db = self
                .databases
                .get_mut(&instance.space)
                .expect("database opened above");
            let writer = &mut self.writer;
            transport::upload(transport, writer, &params, &data, &mut |sent| {
                // Writers refresh last_progress_at no less often than the
                // configured interval so observers can detect stalls.
                if last_update.elapsed() >= interval {
                    last_update = std::time::Instant::now();
                    db.progress(&terminal_id, instance.id, sent, now_us())?;
                }
                Ok(())
            })
        };
        let sent = result?;

        let mark_uploaded = options.mark_uploaded.unwrap_or(self.config.mark_uploaded);
        let db = self.database(instance.space)?;
        if mark_uploaded {
            db.mark_uploaded(
                &terminal_id,
                instance.id,
                transport.name(),
                &instance.fingerprint,
                sent,
            )?;
        } else {
            db.mark_dirty(instance.id, "upload not marked")?;
        }
        log::info!(
            "Uploaded id {} ({} bytes) to {} via {}",
            instance.id,
            sent,
            terminal_id,
            transport
        );
        Ok(())
    }

    /// Encode the instance within the transport byte cap. Returns the
    /// bytes and, when a lower-quality variant had to be chosen, the cap
    /// that was applied (to be recorded for reuse).
    fn prepare_payload(
        &mut self,
        instance: &Instance,
        transport: Transport,
    ) -> Result<(Vec<u8>, Option<u64>)> {
        if !instance.is_file_available() {
            return Err(IkupError::path_gone(format!(
                "{} (or it was overwritten)",
                instance.path.display()
            )));
        }
        let max = match transport {
            Transport::File => self.config.file_max_size,
            Transport::Stream => self.config.stream_max_size,
            Transport::Temp => return Err(IkupError::transport("temp")),
        };
        // A previously chosen variant cap sticks to the instance.
        let cap = instance
            .variant_max_bytes
            .filter(|&c| c < max)
            .unwrap_or(max);

        let src_size = std::fs::metadata(&instance.path)?.len();
        let supported = self.supported_formats();
        let src_format = CacheFormat::from_source(&instance.path);
        let src_supported = supported.contains(&src_format) && src_format.matches_source(&instance.path);
        if src_size <= cap && src_supported {
            return Ok((std::fs::read(&instance.path)?, None));
        }

        let target = if supported.contains(&src_format) {
            src_format
        } else {
            CacheFormat::Png
        };
        let hit = self.cache.convert(
            &instance.path,
            &Constraint {
                max_bytes: Some(cap),
                format: Some(target),
                ..Default::default()
            },
        )?;
        if hit.impossible {
            log::warn!(
                "Id {}: even a 1x1 image exceeds the {} byte cap, sending it anyway",
                instance.id,
                cap
            );
        }
        let recorded = (src_size > cap).then_some(cap);
        Ok((std::fs::read(&hit.entry.path)?, recorded))
    }

    // ---- display ----

    /// Emit the placeholder grid for an instance.
    pub fn display_instance(&mut self, instance: &Instance, display: &DisplayOptions) -> Result<()> {
        self.print_placeholder(
            instance.id,
            instance.space,
            instance.cols,
            instance.rows,
            display,
        )
    }

    pub fn print_placeholder(
        &mut self,
        id: u32,
        space: IdSpace,
        cols: u32,
        rows: u32,
        display: &DisplayOptions,
    ) -> Result<()> {
        let position = match &display.position {
            Some(formula) => Some(self.eval_position(formula, cols, rows)?),
            None => None,
        };
        let use_line_feeds = display
            .use_line_feeds
            .unwrap_or_else(|| position.is_none() && !self.writer.display_is_tty());
        let options = PlaceholderOptions {
            use_line_feeds,
            restore_cursor: display.restore_cursor,
            position,
        };
        let bytes = placeholder::render(id, space, cols, rows, &options)?;
        self.writer.write_display(&bytes)?;
        self.writer.flush()
    }

    /// Evaluate an `X,Y` position formula. Variables: terminal rows and
    /// columns, cursor position, image columns and rows.
    fn eval_position(&mut self, text: &str, cols: u32, rows: u32) -> Result<(u32, u32)> {
        let (term_cols, term_rows) = self.writer.terminal_size().unwrap_or((
            self.config.fallback_max_cols,
            self.config.fallback_max_rows,
        ));
        // The cursor probe needs a tty round-trip; only pay for it when
        // the formula mentions the cursor.
        let cursor = if text.contains("cx") || text.contains("cy") {
            self.writer.cursor_position()
        } else {
            None
        };
        let vars = move |name: &str| -> Option<f64> {
            match name {
                "tr" => Some(term_rows as f64),
                "tc" => Some(term_cols as f64),
                "cx" => cursor.map(|(x, _)| x as f64),
                "cy" => cursor.map(|(_, y)| y as f64),
                "ec" => Some(cols as f64),
                "er" => Some(rows as f64),
                _ => None,
            }
        };
        let (x, y) = formula::eval_pair(text, &vars)?;
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return Err(IkupError::invalid_arg(format!(
                "position must be non-negative: '{}' evaluated to ({}, {})",
                text, x, y
            )));
        }
        Ok((x.round() as u32, y.round() as u32))
    }

    // ---- queries over existing records ----

    /// Resolve a query over ids/paths/all/last into concrete records,
    /// together with the ids and paths that matched nothing.
    pub fn resolve_query(
        &mut self,
        query: &ListQuery,
    ) -> Result<(Vec<(IdSpace, ImageRecord)>, Vec<String>)> {
        let mut records: Vec<(IdSpace, ImageRecord)> = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        match query {
            ListQuery::Ids(ids) => {
                for &id in ids {
                    let space = IdSpace::from_id(id)?;
                    match self.database(space)?.get(id)? {
                        Some(record) => records.push((space, record)),
                        None => missing.push(format!("id:{}", id)),
                    }
                }
            }
            _ => {
                for space in self.known_spaces()? {
                    let db = self.database(space)?;
                    for record in db.list(query)? {
                        records.push((space, record));
                    }
                }
                if let ListQuery::Paths(paths) = query {
                    for path in paths {
                        if !records.iter().any(|(_, r)| &r.path == path) {
                            missing.push(path.display().to_string());
                        }
                    }
                }
                records.sort_by_key(|(_, r)| r.atime_us);
                if let ListQuery::Last(n) = query {
                    let len = records.len();
                    records.drain(..len.saturating_sub(*n));
                }
            }
        }
        Ok((records, missing))
    }

    /// Whether this terminal needs (re)transmission of the record.
    pub fn needs_uploading(&mut self, space: IdSpace, record: &ImageRecord) -> Result<bool> {
        let terminal_id = self.identity.terminal_id.clone();
        let status = self.database(space)?.status(&terminal_id, record.id)?;
        let decision = decide_upload(
            status.as_ref(),
            &record.fingerprint,
            false,
            false,
            self.stall_timeout(),
            &self.reupload_limits(),
            now_us(),
        );
        Ok(decision == UploadDecision::Upload)
    }

    /// The `fix` step for one record: re-transmit unless the status is
    /// already a matching UPLOADED. A vanished source only fails the row
    /// when the terminal's copy is known to differ.
    pub fn fix_record(&mut self, space: IdSpace, record: &ImageRecord) -> Result<bool> {
        if !self.needs_uploading(space, record)? {
            return Ok(false);
        }
        let instance = Instance::from_record(record, space);
        if !instance.is_file_available() {
            return Err(IkupError::path_gone(format!(
                "cannot fix id {}: {}",
                record.id,
                record.path.display()
            )));
        }
        let transport = self.resolve_transport(&UploadOptions::default())?;
        self.transmit(&instance, transport, &UploadOptions::default())?;
        Ok(true)
    }

    /// Unconditional re-transmission of one record.
    pub fn reupload_record(&mut self, space: IdSpace, record: &ImageRecord) -> Result<()> {
        let instance = Instance::from_record(record, space);
        if !instance.is_file_available() {
            return Err(IkupError::path_gone(format!(
                "cannot reupload id {}: {}",
                record.id,
                record.path.display()
            )));
        }
        let transport = self.resolve_transport(&UploadOptions::default())?;
        self.transmit(&instance, transport, &UploadOptions::default())
    }

    pub fn mark_dirty(&mut self, space: IdSpace, id: u32) -> Result<()> {
        self.database(space)?.mark_dirty(id, "marked dirty")
    }

    pub fn forget(&mut self, space: IdSpace, id: u32) -> Result<()> {
        self.database(space)?.forget(&[id])?;
        Ok(())
    }

    pub fn upload_rows(&mut self, space: IdSpace, id: u32) -> Result<Vec<UploadRow>> {
        self.database(space)?.upload_rows(id)
    }

    // ---- maintenance ----

    /// Age-purge sibling database files, trim the open databases and the
    /// transcode cache.
    pub fn cleanup(&mut self) -> Result<Vec<PathBuf>> {
        let max_num_ids = self.config.max_num_ids;
        for space in self.known_spaces()? {
            self.database(space)?.cleanup(max_num_ids)?;
        }
        let keep: Vec<PathBuf> = self.databases.values().map(|db| db.path().to_path_buf()).collect();
        let removed = purge_stale_databases(
            Path::new(&self.config.id_database_dir),
            Duration::from_secs(self.config.max_db_age_days as u64 * 86400),
            &keep,
        )?;
        self.cache.cleanup()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::database::UploadState;

    fn uploaded_row(description: &str, at_us: i64) -> UploadRow {
        UploadRow {
            terminal_id: "term".to_string(),
            id: 1,
            state: UploadState::Uploaded {
                at_us,
                bytes: 10,
                uploads_ago: 1,
                bytes_ago: 0,
            },
            transport: "file".to_string(),
            description: description.to_string(),
            size_bytes: 10,
        }
    }

    fn in_progress_row(description: &str, progress_at: i64) -> UploadRow {
        UploadRow {
            terminal_id: "term".to_string(),
            id: 1,
            state: UploadState::InProgress {
                started_at_us: progress_at,
                last_progress_at_us: progress_at,
                bytes_sent: 5,
            },
            transport: "stream".to_string(),
            description: description.to_string(),
            size_bytes: 10,
        }
    }

    fn limits() -> ReuploadLimits {
        ReuploadLimits {
            max_uploads_ago: 1024,
            max_bytes_ago: 20 * 1024 * 1024,
            max_seconds_ago: 3600,
        }
    }

    const STALL: Duration = Duration::from_secs(2);

    #[test]
    fn test_decision_table() {
        let now = now_us();
        // Matching UPLOADED is a no-op.
        assert_eq!(
            decide_upload(Some(&uploaded_row("fp", now)), "fp", false, false, STALL, &limits(), now),
            UploadDecision::Skip
        );
        // Mismatched description means upload regardless of state.
        assert_eq!(
            decide_upload(Some(&uploaded_row("other", now)), "fp", false, false, STALL, &limits(), now),
            UploadDecision::Upload
        );
        // No status at all means upload.
        assert_eq!(
            decide_upload(None, "fp", false, false, STALL, &limits(), now),
            UploadDecision::Upload
        );
        // Fresh in-progress: trust the other process.
        assert_eq!(
            decide_upload(Some(&in_progress_row("fp", now)), "fp", false, false, STALL, &limits(), now),
            UploadDecision::Wait
        );
        // Stale in-progress: take over.
        let stale = now - 3_000_000;
        assert_eq!(
            decide_upload(Some(&in_progress_row("fp", stale)), "fp", false, false, STALL, &limits(), now),
            UploadDecision::Upload
        );
        // Concurrent uploads skip the wait.
        assert_eq!(
            decide_upload(Some(&in_progress_row("fp", now)), "fp", false, true, STALL, &limits(), now),
            UploadDecision::Upload
        );
        // Force bypasses everything.
        assert_eq!(
            decide_upload(Some(&uploaded_row("fp", now)), "fp", true, false, STALL, &limits(), now),
            UploadDecision::Upload
        );
    }

    #[test]
    fn test_decision_reupload_ageing() {
        let now = now_us();
        let old = now - 4000 * 1_000_000;
        assert_eq!(
            decide_upload(Some(&uploaded_row("fp", old)), "fp", false, false, STALL, &limits(), now),
            UploadDecision::Upload
        );
    }

    struct TestEnv {
        _dir: tempfile::TempDir,
        app: App,
        out_command: PathBuf,
        out_display: PathBuf,
    }

    fn test_env() -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.id_database_dir = dir.path().join("db").to_string_lossy().into_owned();
        config.cache_dir = dir.path().join("cache").to_string_lossy().into_owned();
        config.terminal_name = "xterm".to_string();
        config.terminal_id = "test-term".to_string();
        config.session_id = "test-sess".to_string();
        config.cell_size = "8x16".to_string();
        config.max_cols = "80".to_string();
        config.max_rows = "24".to_string();
        config.upload_method = "file".to_string();
        config.id_space = "8bit_diacritic".to_string();
        config.cleanup_probability = 0.0;
        config.upload_stall_timeout = 0.5;
        config.upload_progress_update_interval = 0.05;
        let out_command = dir.path().join("commands.bin");
        let out_display = dir.path().join("display.bin");
        let app = App::new(config, Some(&out_command), Some(&out_display)).unwrap();
        TestEnv {
            _dir: dir,
            app,
            out_command,
            out_display,
        }
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 7) as u8, (y * 11) as u8, 128, 255])
        });
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_display_flow_emits_one_transmit() {
        let mut env = test_env();
        let src = write_png(env._dir.path(), "wikipedia.png", 40, 32);

        let geometry = GeometryOptions {
            rows: Some(2),
            ..Default::default()
        };
        let options = UploadOptions::default();
        let instance = env.app.assign_id(&src, &geometry, &options).unwrap();
        assert_eq!((instance.cols, instance.rows), (5, 2));
        assert_eq!(instance.space, IdSpace::Bits8Diacritic);

        env.app.upload_instance(&instance, &options).unwrap();
        let commands = std::fs::read_to_string(&env.out_command).unwrap();
        assert_eq!(commands.matches("\x1b_G").count(), 1);
        assert!(commands.contains("t=f,q=2,a=T,U=1,f=100,r=2,c=5;"));

        env.app
            .display_instance(&instance, &DisplayOptions::default())
            .unwrap();
        let display = std::fs::read_to_string(&env.out_display).unwrap();
        assert!(display.contains("\x1b[38;5;0m"));
        assert_eq!(display.matches('\u{10EEEE}').count(), 10);

        // A second upload is a no-op: the status already matches.
        let size_before = std::fs::metadata(&env.out_command).unwrap().len();
        env.app.upload_instance(&instance, &options).unwrap();
        assert_eq!(std::fs::metadata(&env.out_command).unwrap().len(), size_before);

        // assign is idempotent for the unchanged source and box.
        let again = env.app.assign_id(&src, &geometry, &options).unwrap();
        assert_eq!(again.id, instance.id);
    }

    #[test]
    fn test_force_id_steal_then_fix() {
        let mut env = test_env();
        let first = write_png(env._dir.path(), "wikipedia.png", 40, 32);
        let second = write_png(env._dir.path(), "tux.png", 32, 32);
        let id = 0x0012_3456;

        let geometry = GeometryOptions {
            rows: Some(2),
            ..Default::default()
        };
        let options = UploadOptions {
            force_id: Some(id),
            ..Default::default()
        };
        let inst1 = env.app.assign_id(&first, &geometry, &options).unwrap();
        assert_eq!(inst1.space, IdSpace::Bits24);
        env.app.upload_instance(&inst1, &options).unwrap();

        // Stealing the id flips the old upload status to dirty.
        let inst2 = env.app.assign_id(&second, &geometry, &options).unwrap();
        assert_eq!(inst2.id, id);
        let record = env
            .app
            .database(IdSpace::Bits24)
            .unwrap()
            .get(id)
            .unwrap()
            .unwrap();
        assert_eq!(record.fingerprint, inst2.fingerprint);
        assert!(env.app.needs_uploading(IdSpace::Bits24, &record).unwrap());

        // fix re-transmits (a 32x32 square at 2 rows is 4 cols).
        let uploaded = env.app.fix_record(IdSpace::Bits24, &record).unwrap();
        assert!(uploaded);
        let commands = std::fs::read_to_string(&env.out_command).unwrap();
        assert!(commands.contains("r=2,c=4;"));
        assert!(!env.app.needs_uploading(IdSpace::Bits24, &record).unwrap());

        // And a fixed row is a no-op afterwards.
        assert!(!env.app.fix_record(IdSpace::Bits24, &record).unwrap());

        // dirty + fix restores a matching UPLOADED status.
        env.app.mark_dirty(IdSpace::Bits24, id).unwrap();
        assert!(env.app.needs_uploading(IdSpace::Bits24, &record).unwrap());
        assert!(env.app.fix_record(IdSpace::Bits24, &record).unwrap());
        let status = env
            .app
            .database(IdSpace::Bits24)
            .unwrap()
            .status("test-term", id)
            .unwrap()
            .unwrap();
        assert!(status.is_uploaded());
        assert_eq!(status.description, record.fingerprint);
    }

    #[test]
    fn test_placeholder_with_position_formula() {
        let mut env = test_env();
        let display = DisplayOptions {
            position: Some("min(2, tc), 1+2".to_string()),
            ..Default::default()
        };
        env.app
            .print_placeholder(0x0012_3456, IdSpace::Bits24, 2, 1, &display)
            .unwrap();
        let text = std::fs::read_to_string(&env.out_display).unwrap();
        assert!(text.contains("\x1b[4;3H"));

        let bad = DisplayOptions {
            position: Some("cx+nope, 0".to_string()),
            ..Default::default()
        };
        assert!(env
            .app
            .print_placeholder(0x0012_3456, IdSpace::Bits24, 2, 1, &bad)
            .is_err());
    }

    #[test]
    fn test_stalled_upload_is_taken_over() {
        let mut env = test_env();
        let src = write_png(env._dir.path(), "tux.png", 32, 32);
        let geometry = GeometryOptions {
            rows: Some(2),
            ..Default::default()
        };
        let options = UploadOptions::default();
        let instance = env.app.assign_id(&src, &geometry, &options).unwrap();

        // Simulate another process that died mid-upload long ago.
        let stale = now_us() - 10_000_000;
        env.app
            .database(instance.space)
            .unwrap()
            .mark_in_progress(
                "test-term",
                instance.id,
                "stream",
                &instance.fingerprint,
                100,
                stale,
            )
            .unwrap();

        env.app.upload_instance(&instance, &options).unwrap();
        let commands = std::fs::read_to_string(&env.out_command).unwrap();
        assert!(commands.contains("t=f"));
        let status = env
            .app
            .database(instance.space)
            .unwrap()
            .status("test-term", instance.id)
            .unwrap()
            .unwrap();
        assert!(status.is_uploaded());
    }

    #[test]
    fn test_mark_uploaded_false_leaves_dirty() {
        let mut env = test_env();
        let src = write_png(env._dir.path(), "tux.png", 32, 32);
        let geometry = GeometryOptions {
            rows: Some(1),
            ..Default::default()
        };
        let options = UploadOptions {
            mark_uploaded: Some(false),
            ..Default::default()
        };
        let instance = env.app.assign_id(&src, &geometry, &options).unwrap();
        env.app.upload_instance(&instance, &options).unwrap();
        let status = env
            .app
            .database(instance.space)
            .unwrap()
            .status("test-term", instance.id)
            .unwrap()
            .unwrap();
        assert!(matches!(status.state, UploadState::Dirty { .. }));
    }

    #[test]
    fn test_subspace_pins_high_byte_across_spaces() {
        let mut env = test_env();
        let src = write_png(env._dir.path(), "tux.png", 32, 32);
        let geometry = GeometryOptions {
            rows: Some(2),
            ..Default::default()
        };
        for space in IdSpace::ALL {
            let options = UploadOptions {
                id_space: Some(space),
                id_subspace: Some(IdSubspace { begin: 42, end: 43 }),
                ..Default::default()
            };
            let instance = env.app.assign_id(&src, &geometry, &options).unwrap();
            assert_eq!(space.high_byte(instance.id), 0x2A, "space {}", space);
            if space == IdSpace::Bits8 {
                assert_eq!(instance.id, 42);
            }
        }
    }
}
