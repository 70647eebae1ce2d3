use crate::{MapperError, MapperErrorKind, MapperResult, metrics};
use std::collections::{BTreeMap, btree_map::Entry};
use tracing::{debug, info};

/// Host-visible registration shared by every instance of one driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub driver_name: String,
    pub major: u32,
    /// Device node the host exposes, e.g. `pseudo0`.
    pub node: String,
    /// Block-style (seekable) rather than sequential character device.
    pub random_access: bool,
}

/// Host character-device registration, consulted on first bind and last unbind of a driver.
pub trait HostAttach: Send {
    fn attach(&mut self, driver_name: &str, random_access: bool) -> MapperResult<Attachment>;

    fn detach(&mut self, attachment: Attachment);
}

/// Default [`HostAttach`]: hands out dynamic major numbers and names nodes `<driver>0`.
#[derive(Debug)]
pub struct NodeTable {
    next_major: u32,
    live: BTreeMap<u32, String>,
}

impl NodeTable {
    /// First major number handed out. Matches the Linux dynamic character range.
    pub const FIRST_DYNAMIC_MAJOR: u32 = 234;

    pub fn new() -> Self {
        Self {
            next_major: Self::FIRST_DYNAMIC_MAJOR,
            live: BTreeMap::new(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = (u32, &str)> {
        self.live.iter().map(|(major, node)| (*major, node.as_str()))
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAttach for NodeTable {
    fn attach(&mut self, driver_name: &str, random_access: bool) -> MapperResult<Attachment> {
        if driver_name.is_empty() {
            return Err(MapperError::with_message(
                MapperErrorKind::CannotBind,
                "driver name is empty",
            ));
        }
        let major = self.next_major;
        self.next_major = self.next_major.checked_add(1).ok_or_else(|| {
            MapperError::with_message(
                MapperErrorKind::ResourceUnavailable,
                "major numbers exhausted",
            )
        })?;
        let node = format!("{driver_name}0");
        info!(
            driver = driver_name,
            major,
            node = %node,
            random_access,
            "creating device node"
        );
        self.live.insert(major, node.clone());
        Ok(Attachment {
            driver_name: driver_name.to_owned(),
            major,
            node,
            random_access,
        })
    }

    fn detach(&mut self, attachment: Attachment) {
        info!(
            driver = %attachment.driver_name,
            major = attachment.major,
            node = %attachment.node,
            "removing device node"
        );
        self.live.remove(&attachment.major);
    }
}

#[derive(Debug)]
struct BindingEntry {
    refcount: u32,
    attachment: Attachment,
}

/// What an unbind did to the driver's attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// Other instances still hold the attachment.
    Retained { refcount: u32 },
    /// Last reference dropped; the attachment was detached.
    Detached(Attachment),
}

/// Per-driver reference counts over a single host attachment each.
pub struct BindingRegistry {
    host: Box<dyn HostAttach>,
    entries: BTreeMap<String, BindingEntry>,
}

impl BindingRegistry {
    pub fn new(host: impl HostAttach + 'static) -> Self {
        Self {
            host: Box::new(host),
            entries: BTreeMap::new(),
        }
    }

    /// Take a reference on `driver_name`, attaching to the host on the first one.
    pub fn bind(&mut self, driver_name: &str, random_access: bool) -> MapperResult<Attachment> {
        if let Some(entry) = self.entries.get_mut(driver_name) {
            metrics::record_bind();
            entry.refcount += 1;
            debug!(
                driver = driver_name,
                refcount = entry.refcount,
                "driver already attached"
            );
            return Ok(entry.attachment.clone());
        }
        let attachment = self.host.attach(driver_name, random_access)?;
        metrics::record_bind();
        info!(driver = driver_name, major = attachment.major, "driver attached");
        self.entries.insert(
            driver_name.to_owned(),
            BindingEntry {
                refcount: 1,
                attachment: attachment.clone(),
            },
        );
        Ok(attachment)
    }

    /// Drop one reference on `driver_name`, detaching exactly when the count reaches zero.
    ///
    /// Each successful [`BindingRegistry::bind`] must be matched by exactly one call.
    pub fn unbind(&mut self, driver_name: &str) -> MapperResult<UnbindOutcome> {
        let Entry::Occupied(mut occupied) = self.entries.entry(driver_name.to_owned()) else {
            return Err(MapperError::with_message(
                MapperErrorKind::NoDevice,
                format!("driver {driver_name} is not bound"),
            ));
        };
        metrics::record_unbind();
        let entry = occupied.get_mut();
        if entry.refcount > 1 {
            entry.refcount -= 1;
            debug!(
                driver = driver_name,
                refcount = entry.refcount,
                "driver reference dropped"
            );
            return Ok(UnbindOutcome::Retained {
                refcount: entry.refcount,
            });
        }
        let entry = occupied.remove();
        info!(driver = driver_name, major = entry.attachment.major, "driver detached");
        self.host.detach(entry.attachment.clone());
        Ok(UnbindOutcome::Detached(entry.attachment))
    }

    pub fn refcount(&self, driver_name: &str) -> Option<u32> {
        self.entries.get(driver_name).map(|entry| entry.refcount)
    }

    pub fn attachment(&self, driver_name: &str) -> Option<&Attachment> {
        self.entries.get(driver_name).map(|entry| &entry.attachment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl core::fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("entries", &self.entries)
            .finish()
    }
}
