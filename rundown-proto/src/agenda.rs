//! Agenda model for `Rundown` services.
//!
//! A [`Service`] is a dated event with an ordered list of [`AgendaItem`]s.
//! The order of `items` is the playback order used by the live timer, so all
//! reordering goes through [`Service::move_item`], which only ever swaps two
//! adjacent entries.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed title length in characters (services and items).
pub const MAX_TITLE_LENGTH: usize = 256;

/// Upper bound for a single item's duration (24 hours).
pub const MAX_ITEM_DURATION_SECS: u32 = 24 * 60 * 60;

/// Unique identifier for a service, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Creates a new time-ordered service identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ServiceId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for an agenda item. Immutable for the item's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Creates a new time-ordered item identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an `ItemId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a user as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its provider-issued string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation failures for agenda data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Title cannot be empty.
    #[error("title cannot be empty")]
    TitleEmpty,
    /// Title exceeds [`MAX_TITLE_LENGTH`].
    #[error("title too long (max {MAX_TITLE_LENGTH} characters)")]
    TitleTooLong,
    /// Duration must be a positive whole number of seconds.
    #[error("duration must be at least one second")]
    DurationNotPositive,
    /// Duration exceeds [`MAX_ITEM_DURATION_SECS`].
    #[error("duration too long (max {MAX_ITEM_DURATION_SECS} seconds)")]
    DurationTooLong,
    /// An item with this id already exists in the service.
    #[error("duplicate item id: {0}")]
    DuplicateItem(ItemId),
}

/// Converts a minute value entered by a user into whole seconds.
///
/// `seconds = minutes * 60`, truncated toward zero. Whole minutes round-trip
/// exactly through [`whole_minutes`].
///
/// # Errors
///
/// Returns [`ValidationError::DurationNotPositive`] if the result is zero,
/// negative or not a number, and [`ValidationError::DurationTooLong`] if it
/// exceeds [`MAX_ITEM_DURATION_SECS`].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn minutes_to_seconds(minutes: f64) -> Result<u32, ValidationError> {
    let seconds = (minutes * 60.0).trunc();
    if seconds.is_nan() || seconds < 1.0 {
        return Err(ValidationError::DurationNotPositive);
    }
    if seconds > f64::from(MAX_ITEM_DURATION_SECS) {
        return Err(ValidationError::DurationTooLong);
    }
    // Range checked above.
    Ok(seconds as u32)
}

/// Returns the number of whole minutes in `seconds` (truncating).
#[must_use]
pub const fn whole_minutes(seconds: u32) -> u32 {
    seconds / 60
}

/// Checks that a duration is a positive number of seconds within bounds.
///
/// # Errors
///
/// Returns [`ValidationError::DurationNotPositive`] or
/// [`ValidationError::DurationTooLong`].
pub const fn validate_duration(seconds: u32) -> Result<(), ValidationError> {
    if seconds == 0 {
        return Err(ValidationError::DurationNotPositive);
    }
    if seconds > MAX_ITEM_DURATION_SECS {
        return Err(ValidationError::DurationTooLong);
    }
    Ok(())
}

/// Checks that a title is non-empty and within [`MAX_TITLE_LENGTH`].
///
/// # Errors
///
/// Returns [`ValidationError::TitleEmpty`] or [`ValidationError::TitleTooLong`].
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::TitleEmpty);
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong);
    }
    Ok(())
}

/// One timed segment of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaItem {
    /// Immutable item identifier.
    pub id: ItemId,
    /// Display title.
    pub title: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Nominal duration in whole seconds (always > 0).
    pub duration_secs: u32,
    /// Free-form notes for the person running the item.
    pub notes: Option<String>,
    /// Who is responsible for this segment.
    pub person_in_charge: Option<String>,
    /// Ordered list of songs, if any.
    pub song_list: Option<Vec<String>>,
}

/// Input for creating a new agenda item (the id is assigned on insert).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewItem {
    /// Display title.
    pub title: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Nominal duration in whole seconds.
    pub duration_secs: u32,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Who is responsible for this segment.
    pub person_in_charge: Option<String>,
    /// Ordered list of songs, if any.
    pub song_list: Option<Vec<String>>,
}

impl NewItem {
    /// Creates an item input with just a title and duration.
    pub fn new(title: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            title: title.into(),
            duration_secs,
            ..Self::default()
        }
    }

    /// Validates the input and assigns a fresh [`ItemId`].
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an invalid title or duration.
    pub fn into_item(self) -> Result<AgendaItem, ValidationError> {
        validate_title(&self.title)?;
        validate_duration(self.duration_secs)?;
        Ok(AgendaItem {
            id: ItemId::new(),
            title: self.title,
            description: self.description,
            duration_secs: self.duration_secs,
            notes: self.notes,
            person_in_charge: self.person_in_charge,
            song_list: self.song_list,
        })
    }
}

/// Partial update of an agenda item's mutable fields.
///
/// `None` leaves a field untouched. For optional fields, `Some(None)`
/// clears the value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::option_option)]
pub struct ItemPatch {
    /// New title.
    pub title: Option<String>,
    /// New description (or clear).
    pub description: Option<Option<String>>,
    /// New duration in seconds.
    pub duration_secs: Option<u32>,
    /// New notes (or clear).
    pub notes: Option<Option<String>>,
    /// New person in charge (or clear).
    pub person_in_charge: Option<Option<String>>,
    /// New song list (or clear).
    pub song_list: Option<Option<Vec<String>>>,
}

impl AgendaItem {
    /// Applies a patch after validating every field it touches.
    ///
    /// The item is left unchanged if validation fails.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an invalid title or duration.
    pub fn apply_patch(&mut self, patch: ItemPatch) -> Result<(), ValidationError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        if let Some(duration) = patch.duration_secs {
            validate_duration(duration)?;
        }

        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(duration) = patch.duration_secs {
            self.duration_secs = duration;
        }
        if let Some(notes) = patch.notes {
            self.notes = notes;
        }
        if let Some(person) = patch.person_in_charge {
            self.person_in_charge = person;
        }
        if let Some(songs) = patch.song_list {
            self.song_list = songs;
        }
        Ok(())
    }
}

/// Direction for [`Service::move_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Towards index 0.
    Up,
    /// Towards the end of the list.
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A single dated event with an ordered agenda.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service identifier.
    pub id: ServiceId,
    /// Display title.
    pub title: String,
    /// Calendar date of the event.
    pub date: NaiveDate,
    /// Agenda items in playback order.
    pub items: Vec<AgendaItem>,
    /// Users granted edit/control rights on this service.
    pub editable_by: BTreeSet<UserId>,
    /// User who created the service.
    pub created_by: UserId,
}

impl Service {
    /// Creates an empty service. The creator is granted edit rights.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the title is invalid.
    pub fn new(
        title: impl Into<String>,
        date: NaiveDate,
        created_by: UserId,
    ) -> Result<Self, ValidationError> {
        let title = title.into();
        validate_title(&title)?;
        let mut editable_by = BTreeSet::new();
        editable_by.insert(created_by.clone());
        Ok(Self {
            id: ServiceId::new(),
            title,
            date,
            items: Vec::new(),
            editable_by,
            created_by,
        })
    }

    /// Returns the position of an item in playback order.
    #[must_use]
    pub fn item_index(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == *id)
    }

    /// Looks up an item by id.
    #[must_use]
    pub fn item(&self, id: &ItemId) -> Option<&AgendaItem> {
        self.items.iter().find(|item| item.id == *id)
    }

    /// Whether an item with this id is present.
    #[must_use]
    pub fn contains_item(&self, id: &ItemId) -> bool {
        self.item_index(id).is_some()
    }

    /// Returns the item immediately after `id` in playback order.
    #[must_use]
    pub fn item_after(&self, id: &ItemId) -> Option<&AgendaItem> {
        let index = self.item_index(id)?;
        self.items.get(index + 1)
    }

    /// Appends an item at the end of the agenda.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateItem`] if the id is already present.
    pub fn push_item(&mut self, item: AgendaItem) -> Result<(), ValidationError> {
        if self.contains_item(&item.id) {
            return Err(ValidationError::DuplicateItem(item.id));
        }
        self.items.push(item);
        Ok(())
    }

    /// Removes an item, returning it if it was present.
    pub fn remove_item(&mut self, id: &ItemId) -> Option<AgendaItem> {
        let index = self.item_index(id)?;
        Some(self.items.remove(index))
    }

    /// Swaps the item at `index` with its neighbour in `direction`.
    ///
    /// Returns `false` (and leaves the order untouched) when the neighbour
    /// would be out of bounds: index 0 moving up, the last index moving
    /// down, or an `index` past the end.
    pub fn move_item(&mut self, index: usize, direction: Direction) -> bool {
        if index >= self.items.len() {
            return false;
        }
        let neighbour = match direction {
            Direction::Up => index.checked_sub(1),
            Direction::Down => Some(index + 1).filter(|n| *n < self.items.len()),
        };
        let Some(neighbour) = neighbour else {
            return false;
        };
        self.items.swap(index, neighbour);
        true
    }

    /// Total nominal running time of all items, in seconds.
    #[must_use]
    pub fn total_duration_secs(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.duration_secs)).sum()
    }
}
