//! Dedupe loaded images by path. The same shared library shows up in the
//! mapping tables of every task that uses it; one mapped image serves all
//! of them.
use crate::elf::{ElfObject, FileReader};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
pub struct ImageCache {
    images: RefCell<HashMap<PathBuf, Arc<ElfObject>>>,
}

impl ImageCache {
    pub fn new() -> ImageCache {
        ImageCache::default()
    }

    pub fn image_for_path(&self, path: &Path) -> Result<Arc<ElfObject>> {
        if let Some(object) = self.images.borrow().get(path) {
            return Ok(object.clone());
        }
        let reader = Arc::new(FileReader::new(path)?);
        let object = ElfObject::new(reader, path.to_path_buf())?;
        self.images.borrow_mut().insert(path.to_path_buf(), object.clone());
        Ok(object)
    }
}
