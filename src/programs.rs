// Shader program registry. WGSL has no preprocessor, so keyword
// variants are produced by prepending a const block covering the whole
// keyword universe; variants are cached by a hash of the selected set.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

// Every keyword any kernel understands. Each compiled module gets the
// full block so kernels can branch on any of them.
pub const KEYWORDS: &[&str] = &["MANUAL_FILTERING", "SHADING", "BLOOM", "SUNRAYS"];

pub fn assemble_source(base: &str, selected: &[&str]) -> String {
    let mut source = String::with_capacity(base.len() + 64 * KEYWORDS.len());
    for keyword in KEYWORDS {
        let value = selected.contains(keyword);
        source.push_str(&format!("const {}: bool = {};\n", keyword, value));
    }
    source.push('\n');
    source.push_str(base);
    source
}

// Order- and duplicate-insensitive fingerprint of a keyword set.
pub fn keyword_hash(selected: &[&str]) -> u64 {
    let mut sorted: Vec<&str> = selected.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Copy)]
pub struct ProgramDesc {
    pub name: &'static str,
    pub fragment: &'static str,
    pub format: wgpu::TextureFormat,
    pub blend: Option<wgpu::BlendState>,
}

pub struct Program {
    pub pipeline: wgpu::RenderPipeline,
    pub layout: wgpu::BindGroupLayout,
}

pub struct ShaderRegistry {
    vertex: wgpu::ShaderModule,
    cache: HashMap<(&'static str, wgpu::TextureFormat, u64), Program>,
}

impl ShaderRegistry {
    pub fn new(device: &wgpu::Device) -> Self {
        let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fullscreen Vertex"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/fullscreen.wgsl").into()),
        });
        Self {
            vertex,
            cache: HashMap::new(),
        }
    }

    // Cached lookup; compiles on first use of a (program, format,
    // keyword-set) combination. Compile errors are logged and the broken
    // program is still returned rather than aborting the frame loop.
    pub fn get(
        &mut self,
        device: &wgpu::Device,
        desc: ProgramDesc,
        selected: &[&str],
    ) -> &Program {
        let key = (desc.name, desc.format, keyword_hash(selected));
        let vertex = &self.vertex;
        self.cache
            .entry(key)
            .or_insert_with(|| compile(device, vertex, desc, selected))
    }
}

// Bind group following the kernel binding convention: optional uniform
// buffer first, then the sampler, then the input textures in order.
pub fn bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    label: &str,
    uniforms: Option<&wgpu::Buffer>,
    sampler: &wgpu::Sampler,
    textures: &[&wgpu::TextureView],
) -> wgpu::BindGroup {
    let mut entries = Vec::with_capacity(textures.len() + 2);
    let mut binding = 0;
    if let Some(buffer) = uniforms {
        entries.push(wgpu::BindGroupEntry {
            binding,
            resource: buffer.as_entire_binding(),
        });
        binding += 1;
    }
    entries.push(wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    binding += 1;
    for view in textures {
        entries.push(wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::TextureView(view),
        });
        binding += 1;
    }
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

fn compile(
    device: &wgpu::Device,
    vertex: &wgpu::ShaderModule,
    desc: ProgramDesc,
    selected: &[&str],
) -> Program {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let source = assemble_source(desc.fragment, selected);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(desc.name),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(desc.name),
        // Layout is reflected from the shader bindings.
        layout: None,
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: "vs_main",
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &module,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format: desc.format,
                blend: desc.blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    });

    let layout = pipeline.get_bind_group_layout(0);

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        eprintln!(
            "Shader program '{}' (keywords {:?}) failed validation:\n{}",
            desc.name, selected, error
        );
    }

    Program { pipeline, layout }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_defines_whole_universe() {
        let source = assemble_source("fn fs_main() {}", &["BLOOM"]);
        assert!(source.contains("const BLOOM: bool = true;"));
        assert!(source.contains("const SHADING: bool = false;"));
        assert!(source.contains("const SUNRAYS: bool = false;"));
        assert!(source.contains("const MANUAL_FILTERING: bool = false;"));
        let defines_end = source.find("fn fs_main").expect("body missing");
        for keyword in KEYWORDS {
            let at = source.find(keyword).expect("keyword missing");
            assert!(at < defines_end, "{} defined after the body", keyword);
        }
    }

    #[test]
    fn test_keyword_hash_ignores_order_and_duplicates() {
        let a = keyword_hash(&["SHADING", "BLOOM"]);
        let b = keyword_hash(&["BLOOM", "SHADING"]);
        let c = keyword_hash(&["BLOOM", "SHADING", "BLOOM"]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_keyword_hash_distinguishes_sets() {
        let none = keyword_hash(&[]);
        let bloom = keyword_hash(&["BLOOM"]);
        let both = keyword_hash(&["BLOOM", "SUNRAYS"]);
        assert_ne!(none, bloom);
        assert_ne!(bloom, both);
        assert_ne!(none, both);
    }
}
