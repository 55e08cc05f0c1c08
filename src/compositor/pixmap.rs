//! Window pixmaps: committed buffers and their bound textures.
//!
//! A window's content is a tree of pixmaps (the main surface plus
//! sub-surfaces). Each node owns the last committed buffer, the damage
//! accumulated since its texture was last updated, and the texture itself.

use std::rc::Rc;

use tracing::debug;

use super::region::Region;
use super::texture::Texture;
use crate::error::BindError;
use crate::shared::geometry::{Point, Rect, Size};
use crate::shared::image::Image;

#[derive(Debug, Clone)]
pub enum BufferStorage {
    /// Shared-memory image
    Shm(Rc<Image>),
    /// X11 pixmap named from a redirected window
    X11Pixmap(u32),
}

/// One committed client buffer
#[derive(Debug, Clone)]
pub struct Buffer {
    /// Identity of the underlying buffer. Recommitting the same serial with
    /// new contents only re-uploads the damaged part.
    pub serial: u64,
    pub size: Size,
    pub has_alpha: bool,
    pub storage: BufferStorage,
}

impl Buffer {
    pub fn shm(serial: u64, image: Rc<Image>, has_alpha: bool) -> Self {
        Self {
            serial,
            size: image.size(),
            has_alpha,
            storage: BufferStorage::Shm(image),
        }
    }

    pub fn x11_pixmap(serial: u64, pixmap: u32, size: Size, has_alpha: bool) -> Self {
        Self {
            serial,
            size,
            has_alpha,
            storage: BufferStorage::X11Pixmap(pixmap),
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.size)
    }
}

/// Turns buffers into textures of the active backend
pub trait TextureBackend {
    /// Create a texture holding the whole buffer
    fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError>;

    /// Refresh `damage` (buffer-local) of an existing texture
    fn update_texture(
        &mut self,
        texture: &mut Texture,
        buffer: &Buffer,
        damage: &Region,
    ) -> Result<(), BindError>;
}

#[derive(Debug)]
pub struct WindowPixmap {
    /// Sub-surface key, 0 for the root
    key: u32,
    buffer: Option<Buffer>,
    texture: Option<Texture>,
    /// A different buffer was committed since the texture was created
    stale: bool,
    damage: Region,
    discarded: bool,
    /// Offset relative to the parent pixmap (root: offset inside the window)
    position: Point,
    shape: Option<Region>,
    opaque: Region,
    contents_rect: Rect,
    children: Vec<WindowPixmap>,
    upload_count: u32,
}

impl WindowPixmap {
    pub fn new(buffer: Buffer) -> Self {
        let contents_rect = buffer.rect();
        Self {
            key: 0,
            damage: Region::from(buffer.rect()),
            buffer: Some(buffer),
            texture: None,
            stale: false,
            discarded: false,
            position: Point::default(),
            shape: None,
            opaque: Region::new(),
            contents_rect,
            children: Vec::new(),
            upload_count: 0,
        }
    }

    /// Sub-surface pixmap placed at `position` relative to its parent
    pub fn new_child(key: u32, position: Point, buffer: Option<Buffer>) -> Self {
        let mut pixmap = match buffer {
            Some(buffer) => Self::new(buffer),
            None => Self {
                key,
                buffer: None,
                texture: None,
                stale: false,
                damage: Region::new(),
                discarded: false,
                position,
                shape: None,
                opaque: Region::new(),
                contents_rect: Rect::default(),
                children: Vec::new(),
                upload_count: 0,
            },
        };
        pixmap.key = key;
        pixmap.position = position;
        pixmap
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Commit a buffer. The same serial keeps the texture and only records
    /// damage; a new buffer invalidates the texture, which is recreated on
    /// the next bind.
    pub fn attach(&mut self, buffer: Buffer, damage: &Region) {
        let same = self
            .buffer
            .as_ref()
            .is_some_and(|b| b.serial == buffer.serial && b.size == buffer.size);
        if same {
            self.damage |= &(damage & &buffer.rect());
        } else {
            self.stale = self.texture.is_some();
            self.damage = Region::from(buffer.rect());
            self.contents_rect = buffer.rect();
        }
        self.buffer = Some(buffer);
    }

    /// Drop the buffer (unmapped sub-surface). The texture stays usable.
    pub fn detach(&mut self) {
        self.buffer = None;
    }

    pub fn add_damage(&mut self, damage: &Region) {
        if let Some(buffer) = &self.buffer {
            self.damage |= &(damage & &buffer.rect());
        }
    }

    pub fn damage(&self) -> &Region {
        &self.damage
    }

    pub fn reset_damage(&mut self) {
        self.damage = Region::new();
    }

    /// Reset damage of this pixmap and every sub-surface
    pub fn reset_tree_damage(&mut self) {
        self.reset_damage();
        for child in &mut self.children {
            child.reset_tree_damage();
        }
    }

    /// True when the pixmap can be rendered now or after a bind
    pub fn is_valid(&self) -> bool {
        self.texture.is_some() || self.buffer.is_some()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn mark_discarded(&mut self) {
        self.discarded = true;
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn upload_count(&self) -> u32 {
        self.upload_count
    }

    pub fn size(&self) -> Size {
        self.buffer
            .as_ref()
            .map(|b| b.size)
            .or_else(|| self.texture.as_ref().map(Texture::size))
            .unwrap_or_default()
    }

    pub fn has_alpha(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| b.has_alpha)
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn set_position(&mut self, position: Point) {
        self.position = position;
    }

    /// Client contents inside the buffer (excludes the frame of an X11
    /// window pixmap)
    pub fn contents_rect(&self) -> Rect {
        self.contents_rect
    }

    pub fn set_contents_rect(&mut self, rect: Rect) {
        self.contents_rect = rect;
    }

    /// Painted area in pixmap-local coordinates
    pub fn shape(&self) -> Region {
        match &self.shape {
            Some(shape) => shape.clone(),
            None => Region::from(Rect::from_size(self.size())),
        }
    }

    pub fn set_shape(&mut self, shape: Option<Region>) {
        self.shape = shape;
    }

    /// Area known to be fully opaque, pixmap-local
    pub fn opaque(&self) -> &Region {
        &self.opaque
    }

    pub fn set_opaque(&mut self, opaque: Region) {
        self.opaque = opaque;
    }

    pub fn children(&self) -> &[WindowPixmap] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<WindowPixmap> {
        &mut self.children
    }

    pub fn child_mut(&mut self, key: u32) -> Option<&mut WindowPixmap> {
        self.children.iter_mut().find(|c| c.key == key)
    }

    /// Replace the sub-surface list, keeping existing pixmaps (and their
    /// textures) whose key is still present
    pub fn set_children(&mut self, order: &[(u32, Point)]) {
        let mut old = std::mem::take(&mut self.children);
        for &(key, position) in order {
            match old.iter().position(|c| c.key == key) {
                Some(i) => {
                    let mut child = old.swap_remove(i);
                    child.position = position;
                    self.children.push(child);
                }
                None => self.children.push(WindowPixmap::new_child(key, position, None)),
            }
        }
    }

    /// Bind this pixmap and its sub-surfaces. Sub-surface failures leave that
    /// sub-surface without a texture. Damage is not reset here.
    pub fn bind(&mut self, backend: &mut dyn TextureBackend) -> Result<(), BindError> {
        if self.discarded {
            return match self.texture {
                Some(_) => Ok(()),
                None => Err(BindError::NoBuffer),
            };
        }

        for child in &mut self.children {
            if let Err(err) = child.bind(backend) {
                debug!("Compositor: failed to bind sub-surface {}: {}", child.key, err);
            }
        }

        let Some(buffer) = self.buffer.as_ref() else {
            return match self.texture {
                Some(_) => Ok(()),
                None => Err(BindError::NoBuffer),
            };
        };
        if buffer.size.is_empty() {
            return Err(BindError::EmptyBuffer);
        }

        match self.texture.as_mut() {
            Some(texture) if !self.stale => {
                if !self.damage.is_empty() {
                    backend.update_texture(texture, buffer, &self.damage)?;
                    self.upload_count += 1;
                }
            }
            _ => {
                let texture = backend.create_texture(buffer)?;
                self.texture = Some(texture);
                self.stale = false;
                self.upload_count += 1;
            }
        }
        Ok(())
    }

    /// Depth-first walk, children in order. The callback receives each
    /// pixmap with its offset from the root.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a WindowPixmap, Point)) {
        let mut stack: Vec<(&WindowPixmap, Point)> = vec![(self, self.position)];
        while let Some((pixmap, offset)) = stack.pop() {
            f(pixmap, offset);
            for child in pixmap.children.iter().rev() {
                stack.push((child, offset + child.position));
            }
        }
    }

    /// Number of pixmaps in the tree
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(WindowPixmap::count).sum::<usize>()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Uploads into CPU images and records what was uploaded
    #[derive(Default)]
    pub struct FakeUploader {
        pub created: u32,
        pub updated: Vec<Region>,
        pub fail: bool,
    }

    impl TextureBackend for FakeUploader {
        fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError> {
            if self.fail {
                return Err(BindError::Upload("fake failure".into()));
            }
            self.created += 1;
            match &buffer.storage {
                BufferStorage::Shm(image) => Ok(Texture::Raster((**image).clone())),
                BufferStorage::X11Pixmap(_) => Ok(Texture::Raster(Image::new(buffer.size))),
            }
        }

        fn update_texture(
            &mut self,
            texture: &mut Texture,
            buffer: &Buffer,
            damage: &Region,
        ) -> Result<(), BindError> {
            self.updated.push(damage.clone());
            if let (Texture::Raster(target), BufferStorage::Shm(image)) = (texture, &buffer.storage) {
                for r in damage.iter() {
                    target.copy_from(image, *r, r.top_left());
                }
            }
            Ok(())
        }
    }

    pub fn shm_buffer(serial: u64, size: Size, color: u32) -> Buffer {
        Buffer::shm(serial, Rc::new(Image::filled(size, color)), false)
    }

    #[test]
    fn test_second_bind_without_damage_reuses_texture() {
        let mut uploader = FakeUploader::default();
        let mut pixmap = WindowPixmap::new(shm_buffer(1, Size::new(200, 200), 0xff000000));
        pixmap.bind(&mut uploader).unwrap();
        pixmap.reset_damage();
        let first = pixmap.texture().map(|t| t as *const Texture);
        pixmap.bind(&mut uploader).unwrap();
        assert_eq!(pixmap.texture().map(|t| t as *const Texture), first);
        assert_eq!(uploader.created, 1);
        assert!(uploader.updated.is_empty());
        assert_eq!(pixmap.upload_count(), 1);
    }

    #[test]
    fn test_damage_round_trip_updates_only_damaged_area() {
        let mut uploader = FakeUploader::default();
        let size = Size::new(200, 200);
        let mut pixmap = WindowPixmap::new(shm_buffer(1, size, 0xff000000));
        pixmap.bind(&mut uploader).unwrap();
        pixmap.reset_damage();

        let d = Region::from(Rect::new(10, 10, 50, 50));
        pixmap.attach(shm_buffer(1, size, 0xffffffff), &d);
        pixmap.bind(&mut uploader).unwrap();
        pixmap.reset_damage();

        let Some(Texture::Raster(img)) = pixmap.texture() else {
            panic!("expected raster texture");
        };
        assert_eq!(img.pixel(10, 10), 0xffffffff);
        assert_eq!(img.pixel(59, 59), 0xffffffff);
        assert_eq!(img.pixel(60, 60), 0xff000000);
        assert_eq!(img.pixel(5, 5), 0xff000000);
        assert_eq!(uploader.updated, vec![d]);
        assert_eq!(pixmap.upload_count(), 2);
    }

    #[test]
    fn test_new_buffer_recreates_texture_lazily() {
        let mut uploader = FakeUploader::default();
        let mut pixmap = WindowPixmap::new(shm_buffer(1, Size::new(10, 10), 0));
        pixmap.bind(&mut uploader).unwrap();
        pixmap.attach(shm_buffer(2, Size::new(20, 20), 0), &Region::new());
        assert!(pixmap.texture().is_some());
        assert_eq!(uploader.created, 1);
        pixmap.bind(&mut uploader).unwrap();
        assert_eq!(uploader.created, 2);
        assert_eq!(pixmap.texture().map(Texture::size), Some(Size::new(20, 20)));
    }

    #[test]
    fn test_discarded_pixmap_does_not_bind() {
        let mut uploader = FakeUploader::default();
        let mut pixmap = WindowPixmap::new(shm_buffer(1, Size::new(10, 10), 0));
        pixmap.mark_discarded();
        assert!(pixmap.bind(&mut uploader).is_err());
        assert_eq!(uploader.created, 0);
    }

    #[test]
    fn test_visit_is_depth_first_in_order() {
        let mut root = WindowPixmap::new(shm_buffer(1, Size::new(10, 10), 0));
        root.set_children(&[(1, Point::new(1, 1)), (2, Point::new(5, 5))]);
        if let Some(child) = root.child_mut(1) {
            child.set_children(&[(3, Point::new(1, 0))]);
        }
        let mut order = Vec::new();
        root.visit(&mut |p, offset| order.push((p.key(), offset)));
        assert_eq!(
            order,
            vec![
                (0, Point::new(0, 0)),
                (1, Point::new(1, 1)),
                (3, Point::new(2, 1)),
                (2, Point::new(5, 5)),
            ]
        );
        assert_eq!(root.count(), 4);
    }
}
