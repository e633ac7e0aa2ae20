use crate::event_manager::{
	EventId, EventManagerConfig, EventMetadata, EventsResponse, RepositoryError, State, UserId,
};
use crate::utils::{current_time_millis, storage_key};

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Repository for per-stream sync metadata and cached batches.
///
/// Caching a batch (`update`) and committing its cursor (`update_event_id`) are separate steps so
/// the orchestrator can resume after a crash between them. Every method writes its row atomically.
#[async_trait::async_trait]
pub trait EventMetadataRepository: Send + Sync {
	async fn get(
		&self,
		config: &EventManagerConfig,
	) -> Result<Option<EventMetadata>, RepositoryError>;

	async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError>;

	/// Insert fresh metadata unless a row already exists; returns the stored row.
	async fn create(&self, config: &EventManagerConfig) -> Result<EventMetadata, RepositoryError>;

	/// Cache `response` and store `metadata` with `next_event_id` pointing at it.
	async fn update(
		&self,
		metadata: &EventMetadata,
		response: &EventsResponse,
	) -> Result<(), RepositoryError>;

	/// Read a cached batch.
	async fn get_events(
		&self,
		config: &EventManagerConfig,
		event_id: &EventId,
	) -> Result<Option<EventsResponse>, RepositoryError>;

	/// Commit `new` as the applied cursor if the current cursor still equals `old`.
	///
	/// Clears the cached batch and the retry counter and returns the stream to `Idle`.
	async fn update_event_id(
		&self,
		config: &EventManagerConfig,
		old: Option<&EventId>,
		new: &EventId,
	) -> Result<(), RepositoryError>;

	async fn update_state(
		&self,
		config: &EventManagerConfig,
		state: State,
	) -> Result<(), RepositoryError>;

	async fn update_retry(
		&self,
		config: &EventManagerConfig,
		retry_count: u32,
	) -> Result<(), RepositoryError>;

	/// Replace the whole row in one write.
	async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError>;

	/// Drop the cursor, cached batch and retries and mark the stream for resync.
	async fn reset(&self, config: &EventManagerConfig) -> Result<(), RepositoryError>;

	/// Remove the row and every cached batch of the stream.
	async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError>;
}

fn commit_cursor(
	metadata: &mut EventMetadata,
	old: Option<&EventId>,
	new: &EventId,
) -> Result<(), RepositoryError> {
	if metadata.current_event_id.as_ref() != old {
		return Err(RepositoryError::Conflict {
			config: metadata.config.clone(),
			expected: old.cloned(),
			actual: metadata.current_event_id.clone(),
		});
	}
	metadata.current_event_id = Some(new.clone());
	metadata.next_event_id = None;
	metadata.retry_count = 0;
	metadata.state = State::Idle;
	metadata.last_used_at_millis = current_time_millis();
	Ok(())
}

fn reset_cursor(metadata: &mut EventMetadata) {
	metadata.current_event_id = None;
	metadata.next_event_id = None;
	metadata.retry_count = 0;
	metadata.state = State::Resync;
	metadata.last_used_at_millis = current_time_millis();
}

#[derive(Default)]
struct StoredStream {
	metadata: Option<EventMetadata>,
	batches: HashMap<EventId, EventsResponse>,
}

/// Volatile repository, used by tests and by hosts without durable storage
#[derive(Default)]
pub struct InMemoryEventMetadataRepository {
	streams: Mutex<HashMap<EventManagerConfig, StoredStream>>,
}

impl InMemoryEventMetadataRepository {
	pub fn new() -> Self {
		Self::default()
	}

	async fn modify(
		&self,
		config: &EventManagerConfig,
		f: impl FnOnce(&mut EventMetadata) -> Result<(), RepositoryError> + Send,
	) -> Result<(), RepositoryError> {
		let mut streams = self.streams.lock().await;
		let metadata = streams
			.get_mut(config)
			.and_then(|s| s.metadata.as_mut())
			.ok_or_else(|| RepositoryError::NotFound(config.clone()))?;

		// Work on a copy so a failed check leaves the row untouched.
		let mut updated = metadata.clone();
		f(&mut updated)?;
		*metadata = updated;
		Ok(())
	}
}

#[async_trait::async_trait]
impl EventMetadataRepository for InMemoryEventMetadataRepository {
	async fn get(
		&self,
		config: &EventManagerConfig,
	) -> Result<Option<EventMetadata>, RepositoryError> {
		let streams = self.streams.lock().await;
		Ok(streams.get(config).and_then(|s| s.metadata.clone()))
	}

	async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError> {
		let streams = self.streams.lock().await;
		Ok(streams
			.values()
			.filter_map(|s| s.metadata.clone())
			.filter(|m| &m.config.user_id == user_id)
			.collect())
	}

	async fn create(&self, config: &EventManagerConfig) -> Result<EventMetadata, RepositoryError> {
		let mut streams = self.streams.lock().await;
		let stream = streams.entry(config.clone()).or_default();
		Ok(stream
			.metadata
			.get_or_insert_with(|| EventMetadata::new(config.clone()))
			.clone())
	}

	async fn update(
		&self,
		metadata: &EventMetadata,
		response: &EventsResponse,
	) -> Result<(), RepositoryError> {
		let mut streams = self.streams.lock().await;
		let stream = streams.entry(metadata.config.clone()).or_default();

		let mut row = metadata.clone();
		row.next_event_id = Some(response.next_event_id.clone());
		row.last_used_at_millis = current_time_millis();

		stream.batches.clear();
		stream
			.batches
			.insert(response.next_event_id.clone(), response.clone());
		stream.metadata = Some(row);
		Ok(())
	}

	async fn get_events(
		&self,
		config: &EventManagerConfig,
		event_id: &EventId,
	) -> Result<Option<EventsResponse>, RepositoryError> {
		let streams = self.streams.lock().await;
		Ok(streams
			.get(config)
			.and_then(|s| s.batches.get(event_id).cloned()))
	}

	async fn update_event_id(
		&self,
		config: &EventManagerConfig,
		old: Option<&EventId>,
		new: &EventId,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| commit_cursor(m, old, new)).await?;
		if let Some(stream) = self.streams.lock().await.get_mut(config) {
			stream.batches.clear();
		}
		Ok(())
	}

	async fn update_state(
		&self,
		config: &EventManagerConfig,
		state: State,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| {
			m.state = state;
			m.last_used_at_millis = current_time_millis();
			Ok(())
		})
		.await
	}

	async fn update_retry(
		&self,
		config: &EventManagerConfig,
		retry_count: u32,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| {
			m.retry_count = retry_count;
			Ok(())
		})
		.await
	}

	async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
		let mut streams = self.streams.lock().await;
		streams.entry(metadata.config.clone()).or_default().metadata = Some(metadata.clone());
		Ok(())
	}

	async fn reset(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
		let mut streams = self.streams.lock().await;
		let stream = streams.entry(config.clone()).or_default();
		let metadata = stream
			.metadata
			.get_or_insert_with(|| EventMetadata::new(config.clone()));
		reset_cursor(metadata);
		stream.batches.clear();
		Ok(())
	}

	async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
		self.streams.lock().await.remove(config);
		Ok(())
	}
}

/// File-based implementation of EventMetadataRepository.
///
/// Layout under `data_dir`:
/// - `<key>.meta.json`: the metadata row of a stream
/// - `<key>/<hex(event_id)>.json`: the cached batch the row's `next_event_id` points at
///
/// Files are written to a temporary sibling and renamed into place, so a reader never observes a
/// half-written row. A batch is always written before the row that references it.
pub struct FileEventMetadataRepository {
	data_dir: PathBuf,
	/// Serializes read-modify-write cycles on rows.
	write_lock: Mutex<()>,
}

impl FileEventMetadataRepository {
	pub async fn new(data_dir: PathBuf) -> Result<Self, RepositoryError> {
		tokio::fs::create_dir_all(&data_dir).await?;
		info!("Using event metadata directory {:?}", data_dir);
		Ok(Self {
			data_dir,
			write_lock: Mutex::new(()),
		})
	}

	fn key(config: &EventManagerConfig) -> String {
		storage_key(&config.user_id.0, &config.scope_id)
	}

	fn get_metadata_filename(&self, config: &EventManagerConfig) -> PathBuf {
		self.data_dir.join(format!("{}.meta.json", Self::key(config)))
	}

	fn get_batch_dir(&self, config: &EventManagerConfig) -> PathBuf {
		self.data_dir.join(Self::key(config))
	}

	fn get_batch_filename(&self, config: &EventManagerConfig, event_id: &EventId) -> PathBuf {
		self.get_batch_dir(config)
			.join(format!("{}.json", hex::encode(&event_id.0)))
	}

	async fn write_atomic(path: &Path, content: Vec<u8>) -> Result<(), RepositoryError> {
		let tmp = path.with_extension("tmp");
		let mut file = tokio::fs::File::create(&tmp).await?;
		file.write_all(&content).await?;
		// Contents must be durable before the rename makes them visible.
		file.sync_all().await?;
		drop(file);
		tokio::fs::rename(&tmp, path).await?;
		Ok(())
	}

	async fn read_metadata(
		&self,
		config: &EventManagerConfig,
	) -> Result<Option<EventMetadata>, RepositoryError> {
		read_json(&self.get_metadata_filename(config)).await
	}

	async fn write_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
		let content = serde_json::to_vec_pretty(metadata)?;
		Self::write_atomic(&self.get_metadata_filename(&metadata.config), content).await
	}

	async fn remove_batches(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
		match tokio::fs::remove_dir_all(self.get_batch_dir(config)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	async fn modify(
		&self,
		config: &EventManagerConfig,
		f: impl FnOnce(&mut EventMetadata) -> Result<(), RepositoryError> + Send,
	) -> Result<(), RepositoryError> {
		let _guard = self.write_lock.lock().await;
		let mut metadata = self
			.read_metadata(config)
			.await?
			.ok_or_else(|| RepositoryError::NotFound(config.clone()))?;
		f(&mut metadata)?;
		self.write_metadata(&metadata).await
	}
}

async fn read_json<T: serde::de::DeserializeOwned>(
	path: &Path,
) -> Result<Option<T>, RepositoryError> {
	match tokio::fs::read(path).await {
		Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(e.into()),
	}
}

#[async_trait::async_trait]
impl EventMetadataRepository for FileEventMetadataRepository {
	async fn get(
		&self,
		config: &EventManagerConfig,
	) -> Result<Option<EventMetadata>, RepositoryError> {
		self.read_metadata(config).await
	}

	async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError> {
		let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
		let mut all = Vec::new();

		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			let is_row = path
				.file_name()
				.and_then(|f| f.to_str())
				.is_some_and(|f| f.ends_with(".meta.json"));
			if !is_row {
				continue;
			}

			match read_json::<EventMetadata>(&path).await {
				Ok(Some(metadata)) if &metadata.config.user_id == user_id => all.push(metadata),
				Ok(_) => {}
				Err(e) => warn!("Skipping unreadable metadata {:?}: {}", path, e),
			}
		}

		Ok(all)
	}

	async fn create(&self, config: &EventManagerConfig) -> Result<EventMetadata, RepositoryError> {
		let _guard = self.write_lock.lock().await;
		if let Some(existing) = self.read_metadata(config).await? {
			return Ok(existing);
		}

		let metadata = EventMetadata::new(config.clone());
		self.write_metadata(&metadata).await?;
		debug!("Created event metadata for {}", config);
		Ok(metadata)
	}

	async fn update(
		&self,
		metadata: &EventMetadata,
		response: &EventsResponse,
	) -> Result<(), RepositoryError> {
		let _guard = self.write_lock.lock().await;
		let config = &metadata.config;

		self.remove_batches(config).await?;
		tokio::fs::create_dir_all(self.get_batch_dir(config)).await?;
		let batch = serde_json::to_vec(response)?;
		Self::write_atomic(
			&self.get_batch_filename(config, &response.next_event_id),
			batch,
		)
		.await?;

		let mut row = metadata.clone();
		row.next_event_id = Some(response.next_event_id.clone());
		row.last_used_at_millis = current_time_millis();
		self.write_metadata(&row).await?;

		debug!(
			"Cached {} events for {} under {}",
			response.events.len(),
			config,
			response.next_event_id
		);
		Ok(())
	}

	async fn get_events(
		&self,
		config: &EventManagerConfig,
		event_id: &EventId,
	) -> Result<Option<EventsResponse>, RepositoryError> {
		read_json(&self.get_batch_filename(config, event_id)).await
	}

	async fn update_event_id(
		&self,
		config: &EventManagerConfig,
		old: Option<&EventId>,
		new: &EventId,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| commit_cursor(m, old, new)).await?;
		// Leftover batch files after a crash here are harmless; the next cache replaces them.
		self.remove_batches(config).await
	}

	async fn update_state(
		&self,
		config: &EventManagerConfig,
		state: State,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| {
			m.state = state;
			m.last_used_at_millis = current_time_millis();
			Ok(())
		})
		.await
	}

	async fn update_retry(
		&self,
		config: &EventManagerConfig,
		retry_count: u32,
	) -> Result<(), RepositoryError> {
		self.modify(config, |m| {
			m.retry_count = retry_count;
			Ok(())
		})
		.await
	}

	async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
		let _guard = self.write_lock.lock().await;
		self.write_metadata(metadata).await
	}

	async fn reset(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
		let _guard = self.write_lock.lock().await;
		let mut metadata = self
			.read_metadata(config)
			.await?
			.unwrap_or_else(|| EventMetadata::new(config.clone()));
		reset_cursor(&mut metadata);
		self.write_metadata(&metadata).await?;
		self.remove_batches(config).await
	}

	async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
		let _guard = self.write_lock.lock().await;
		match tokio::fs::remove_file(self.get_metadata_filename(config)).await {
			Ok(()) => {}
			Err(e) if e.kind() == ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		self.remove_batches(config).await?;
		info!("Deleted event metadata for {}", config);
		Ok(())
	}
}
