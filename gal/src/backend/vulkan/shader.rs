// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GLSL stages compiled to SPIR-V with naga.

use std::collections::{BTreeMap, HashMap};

use ash::vk;
use log::{debug, trace};

use super::device::VulkanGarbage;
use super::{OrHost, VulkanBackend};
use crate::backend::ShaderBackend;
use crate::error::{GalError, GalResult};
use crate::shader::{StageKind, UniformBlockBinding};

pub struct VulkanShader {
    module: vk::ShaderModule,
    kind: StageKind,
    /// Block and instance names of every uniform block the stage declares.
    uniform_blocks: Vec<String>,
}

impl VulkanShader {
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn declares_block(&self, name: &str) -> bool {
        self.uniform_blocks.iter().any(|b| b == name)
    }
}

pub struct VulkanProgram {
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    stages: Vec<(StageKind, vk::ShaderModule)>,
    /// Sampler name to texture unit, consulted when descriptor sets are written.
    texture_units: HashMap<String, u32>,
}

impl VulkanProgram {
    pub fn texture_unit(&self, name: &str) -> Option<u32> {
        self.texture_units.get(name).copied()
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn stages(&self) -> &[(StageKind, vk::ShaderModule)] {
        &self.stages
    }
}

fn naga_stage(kind: StageKind) -> Option<naga::ShaderStage> {
    match kind {
        StageKind::Vertex => Some(naga::ShaderStage::Vertex),
        StageKind::Fragment => Some(naga::ShaderStage::Fragment),
        _ => None,
    }
}

fn vk_stage_flags(kind: StageKind) -> vk::ShaderStageFlags {
    match kind {
        StageKind::Vertex => vk::ShaderStageFlags::VERTEX,
        StageKind::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        StageKind::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        StageKind::Geometry => vk::ShaderStageFlags::GEOMETRY,
        StageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
        StageKind::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

/// Parse, validate and translate one GLSL stage. Returns the SPIR-V words
/// and the uniform block names found in the module.
fn compile_glsl(kind: StageKind, source: &str) -> GalResult<(Vec<u32>, Vec<String>)> {
    let stage = naga_stage(kind).ok_or(GalError::NotSupported("GLSL stages other than vertex and fragment"))?;
    let compile_error = |log: String| GalError::Compile { stage: kind, log };

    let options = naga::front::glsl::Options::from(stage);
    let module = naga::front::glsl::Frontend::default()
        .parse(&options, source)
        .map_err(|e| compile_error(format!("{e:?}")))?;

    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
        .validate(&module)
        .map_err(|e| compile_error(format!("validation failed: {e:?}")))?;

    let spv_options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    let spirv = naga::back::spv::write_vec(&module, &info, &spv_options, None)
        .map_err(|e| compile_error(format!("SPIR-V generation failed: {e:?}")))?;

    let mut blocks = Vec::new();
    for (_, var) in module.global_variables.iter() {
        if var.space != naga::AddressSpace::Uniform {
            continue;
        }
        blocks.extend(var.name.clone());
        blocks.extend(module.types[var.ty].name.clone());
    }
    Ok((spirv, blocks))
}

/// Descriptor bindings for `blocks`, merging stages that share a slot.
fn uniform_layout_bindings(blocks: &[UniformBlockBinding]) -> Vec<vk::DescriptorSetLayoutBinding> {
    let mut by_slot: BTreeMap<u32, vk::ShaderStageFlags> = BTreeMap::new();
    for block in blocks {
        *by_slot.entry(block.slot).or_insert_with(vk::ShaderStageFlags::empty) |= vk_stage_flags(block.stage);
    }
    by_slot
        .into_iter()
        .map(|(slot, stage_flags)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(slot)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build()
        })
        .collect()
}

impl ShaderBackend for VulkanBackend {
    type Shader = VulkanShader;
    type Program = VulkanProgram;

    fn compile_shader(&mut self, kind: StageKind, source: &str) -> GalResult<VulkanShader> {
        let (spirv, uniform_blocks) = compile_glsl(kind, source)?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&spirv);
        let module = unsafe { self.ctx.device.create_shader_module(&info, None) }.or_host("vkCreateShaderModule")?;
        trace!("Compiled {:?} stage: {} SPIR-V words", kind, spirv.len());
        Ok(VulkanShader {
            module,
            kind,
            uniform_blocks,
        })
    }

    fn link_program(
        &mut self,
        stages: &[(StageKind, &VulkanShader)],
        uniform_blocks: &[UniformBlockBinding],
    ) -> GalResult<VulkanProgram> {
        if let Some((kind, shader)) = stages.iter().find(|(kind, shader)| *kind != shader.kind) {
            return Err(GalError::Link {
                log: format!("{:?} shader attached as {:?}", shader.kind, kind),
            });
        }
        for block in uniform_blocks {
            let declared = stages
                .iter()
                .any(|(kind, shader)| *kind == block.stage && shader.declares_block(&block.name));
            if !declared {
                return Err(GalError::Link {
                    log: format!("uniform block '{}' not found in {:?} stage", block.name, block.stage),
                });
            }
        }

        let device = &self.ctx.device;
        let bindings = uniform_layout_bindings(uniform_blocks);
        let set_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout =
            unsafe { device.create_descriptor_set_layout(&set_info, None) }.or_host("vkCreateDescriptorSetLayout")?;

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(std::slice::from_ref(&set_layout));
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(GalError::host("vkCreatePipelineLayout", e));
            }
        };

        debug!(
            "Linked program: {} stages, {} uniform bindings",
            stages.len(),
            bindings.len()
        );
        Ok(VulkanProgram {
            set_layout,
            pipeline_layout,
            stages: stages.iter().map(|(kind, shader)| (*kind, shader.module)).collect(),
            texture_units: HashMap::new(),
        })
    }

    fn use_program(&mut self, program: &VulkanProgram) -> GalResult<()> {
        self.current_program = Some(program.pipeline_layout);
        Ok(())
    }

    fn set_texture_binding(&mut self, program: &mut VulkanProgram, name: &str, unit: u32) -> GalResult<()> {
        program.texture_units.insert(name.to_string(), unit);
        Ok(())
    }

    fn destroy_shader(&mut self, shader: VulkanShader) {
        self.tracker.defer_release(VulkanGarbage::ShaderModule(shader.module));
    }

    fn destroy_program(&mut self, program: VulkanProgram) {
        if self.current_program == Some(program.pipeline_layout) {
            self.current_program = None;
        }
        self.tracker.defer_release(VulkanGarbage::Program {
            set_layout: program.set_layout,
            pipeline_layout: program.pipeline_layout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = r#"#version 450
layout(set = 0, binding = 0) uniform Transform {
    mat4 mvp;
} transform;
layout(location = 0) in vec3 position;
void main() {
    gl_Position = transform.mvp * vec4(position, 1.0);
}
"#;

    const FRAGMENT: &str = r#"#version 450
layout(location = 0) out vec4 color;
void main() {
    color = vec4(1.0, 0.5, 0.25, 1.0);
}
"#;

    #[test]
    fn test_compile_vertex_finds_uniform_block() {
        let (spirv, blocks) = compile_glsl(StageKind::Vertex, VERTEX).unwrap();
        // SPIR-V magic number.
        assert_eq!(spirv[0], 0x0723_0203);
        assert!(blocks.iter().any(|b| b == "Transform" || b == "transform"));
    }

    #[test]
    fn test_compile_fragment() {
        let (spirv, blocks) = compile_glsl(StageKind::Fragment, FRAGMENT).unwrap();
        assert_eq!(spirv[0], 0x0723_0203);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_compile_error_reports_stage() {
        match compile_glsl(StageKind::Fragment, "#version 450\nvoid main() { undeclared = 1; }\n") {
            Err(GalError::Compile { stage, log }) => {
                assert_eq!(stage, StageKind::Fragment);
                assert!(!log.is_empty());
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unsupported_stage() {
        let err = compile_glsl(StageKind::Geometry, VERTEX).unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_uniform_layout_bindings_merge_stages() {
        let block = |stage, slot| UniformBlockBinding {
            stage,
            name: "Transform".to_string(),
            cbuf: 0,
            slot,
        };
        let bindings = uniform_layout_bindings(&[
            block(StageKind::Vertex, 2),
            block(StageKind::Fragment, 2),
            block(StageKind::Fragment, 0),
        ]);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(bindings[1].binding, 2);
        assert_eq!(
            bindings[1].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }
}
