// Render targets: the simulation fields live in small float textures
// that are sampled by one pass and written by the next. Double buffers
// swap roles instead of copying.

pub fn texel_size(width: u32, height: u32) -> [f32; 2] {
    [1.0 / width as f32, 1.0 / height as f32]
}

// Maps a logical resolution scalar onto the window: the short screen
// axis gets round(r) texels, the long axis round(r * aspect).
pub fn grid_size(resolution: u32, screen_width: u32, screen_height: u32) -> (u32, u32) {
    let screen_width = screen_width.max(1);
    let screen_height = screen_height.max(1);
    let mut aspect = screen_width as f32 / screen_height as f32;
    if aspect < 1.0 {
        aspect = 1.0 / aspect;
    }
    let min = resolution.max(1);
    let max = (resolution as f32 * aspect).round() as u32;
    if screen_width > screen_height {
        (max, min)
    } else {
        (min, max)
    }
}

pub struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub texel_size: [f32; 2],
    pub format: wgpu::TextureFormat,
    pub filter: wgpu::FilterMode,
}

impl RenderTarget {
    pub fn new(
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        filter: wgpu::FilterMode,
    ) -> Self {
        debug_assert!(width > 0 && height > 0, "render target must not be empty");
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
            texel_size: texel_size(width, height),
            format,
            filter,
        }
    }
}

// Two equally shaped targets with interchangeable read/write roles.
// A pass samples `read()`, renders into `write()`, then the owner
// calls `swap()`. No pass ever touches both sides of one target.
pub struct DoubleBuffer<T> {
    front: T,
    back: T,
}

impl<T> DoubleBuffer<T> {
    pub fn new(front: T, back: T) -> Self {
        Self { front, back }
    }

    pub fn read(&self) -> &T {
        &self.front
    }

    pub fn write(&self) -> &T {
        &self.back
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    // Used by resize: the resampled read side plus a fresh write side.
    pub fn replace(&mut self, front: T, back: T) -> (T, T) {
        let old_front = std::mem::replace(&mut self.front, front);
        let old_back = std::mem::replace(&mut self.back, back);
        (old_front, old_back)
    }
}

impl DoubleBuffer<RenderTarget> {
    pub fn create(
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        filter: wgpu::FilterMode,
    ) -> Self {
        Self::new(
            RenderTarget::new(device, &format!("{label}_front"), width, height, format, filter),
            RenderTarget::new(device, &format!("{label}_back"), width, height, format, filter),
        )
    }

    pub fn width(&self) -> u32 {
        self.front.width
    }

    pub fn height(&self) -> u32 {
        self.front.height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.front.texel_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_exchanges_roles() {
        let mut pair = DoubleBuffer::new("a", "b");
        assert_eq!(*pair.read(), "a");
        assert_eq!(*pair.write(), "b");
        pair.swap();
        assert_eq!(*pair.read(), "b");
        assert_eq!(*pair.write(), "a");
    }

    #[test]
    fn test_swap_is_an_involution() {
        let mut pair = DoubleBuffer::new(1u32, 2u32);
        pair.swap();
        pair.swap();
        assert_eq!(*pair.read(), 1);
        assert_eq!(*pair.write(), 2);
    }

    #[test]
    fn test_swap_preserves_shape() {
        // Stand-in payloads carry (width, height); swapping roles must
        // never change the shape either side reports.
        let mut pair = DoubleBuffer::new((64u32, 32u32), (64u32, 32u32));
        pair.swap();
        assert_eq!(*pair.read(), (64, 32));
        assert_eq!(*pair.write(), (64, 32));
    }

    #[test]
    fn test_texel_size_is_reciprocal() {
        let ts = texel_size(128, 256);
        assert!((ts[0] - 1.0 / 128.0).abs() < 1e-9);
        assert!((ts[1] - 1.0 / 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_grid_size_landscape() {
        // 2:1 window, wider than tall: long axis gets the scaled value.
        assert_eq!(grid_size(128, 1600, 800), (256, 128));
    }

    #[test]
    fn test_grid_size_portrait() {
        assert_eq!(grid_size(128, 800, 1600), (128, 256));
    }

    #[test]
    fn test_grid_size_square() {
        assert_eq!(grid_size(128, 900, 900), (128, 128));
    }

    #[test]
    fn test_grid_size_rounds_to_nearest() {
        // 1280x1024 -> aspect 1.25, 128 * 1.25 = 160 exactly.
        assert_eq!(grid_size(128, 1280, 1024), (160, 128));
        // 1366x768 -> aspect ~1.7786, 128 * aspect ~ 227.66 -> 228.
        assert_eq!(grid_size(128, 1366, 768), (228, 128));
    }

    #[test]
    fn test_grid_size_tolerates_zero_screen() {
        let (w, h) = grid_size(128, 0, 0);
        assert!(w >= 1 && h >= 1);
    }
}
