// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shader stage and linked program caches.
//!
//! Stages are compiled lazily, once per `(kind, key)`, and shared by every
//! program that uses them. Programs are memoized per combination of bound
//! stages. Uniform blocks get binding slots in stage order, starting at 0.

use std::collections::HashMap;

use gal_common::{CacheKey, CONST_BUFFERS_PER_STAGE, GRAPHICS_STAGE_COUNT};
use log::{debug, trace, warn};

use crate::backend::ShaderBackend;
use crate::error::{GalError, GalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Vertex,
    TessControl,
    TessEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl StageKind {
    pub const GRAPHICS: [StageKind; GRAPHICS_STAGE_COUNT] = [
        StageKind::Vertex,
        StageKind::TessControl,
        StageKind::TessEvaluation,
        StageKind::Geometry,
        StageKind::Fragment,
    ];

    /// Position in the linked-program tuple. `None` for compute.
    pub fn graphics_index(self) -> Option<usize> {
        match self {
            StageKind::Vertex => Some(0),
            StageKind::TessControl => Some(1),
            StageKind::TessEvaluation => Some(2),
            StageKind::Geometry => Some(3),
            StageKind::Fragment => Some(4),
            StageKind::Compute => None,
        }
    }
}

/// A texture or uniform block a stage reads, as reported by the shader
/// translator. `index` is the guest slot (const buffer index for uniforms).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDecl {
    pub name: String,
    pub index: u32,
}

impl ShaderDecl {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub kind: StageKind,
    pub key: CacheKey,
}

/// The bound graphics stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProgramKey(pub [Option<CacheKey>; GRAPHICS_STAGE_COUNT]);

impl ProgramKey {
    pub fn stage(&self, kind: StageKind) -> Option<StageKey> {
        let index = kind.graphics_index()?;
        self.0[index].map(|key| StageKey { kind, key })
    }

    pub fn stages(&self) -> impl Iterator<Item = StageKey> + '_ {
        StageKind::GRAPHICS
            .iter()
            .filter_map(move |&kind| self.stage(kind))
    }

    pub fn is_linkable(&self) -> bool {
        self.0[0].is_some() && self.0[4].is_some()
    }
}

/// Binding slot assigned to one uniform block of a linked program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlockBinding {
    pub stage: StageKind,
    pub name: String,
    /// Guest const buffer index the block reads from.
    pub cbuf: u32,
    pub slot: u32,
}

struct ShaderStage<S> {
    source: String,
    texture_usage: Vec<ShaderDecl>,
    uniform_usage: Vec<ShaderDecl>,
    compiled: Option<S>,
}

/// Const buffer keys bound by the guest, per stage and slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferBindings {
    keys: [[Option<CacheKey>; CONST_BUFFERS_PER_STAGE]; GRAPHICS_STAGE_COUNT],
}

impl Default for BufferBindings {
    fn default() -> Self {
        Self {
            keys: [[None; CONST_BUFFERS_PER_STAGE]; GRAPHICS_STAGE_COUNT],
        }
    }
}

impl BufferBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` for const buffer `cbuf` of `kind`. Out of range slots
    /// and compute stages are ignored.
    pub fn set(&mut self, kind: StageKind, cbuf: u32, key: Option<CacheKey>) {
        if let Some(stage) = kind.graphics_index() {
            if let Some(slot) = self.keys[stage].get_mut(cbuf as usize) {
                *slot = key;
            }
        }
    }

    pub fn get(&self, kind: StageKind, cbuf: u32) -> Option<CacheKey> {
        let stage = kind.graphics_index()?;
        self.keys[stage].get(cbuf as usize).copied().flatten()
    }
}

pub struct ProgramCache<B: ShaderBackend> {
    stages: HashMap<StageKey, ShaderStage<B::Shader>>,
    programs: HashMap<ProgramKey, B::Program>,
    current: ProgramKey,
    active: Option<ProgramKey>,
}

impl<B: ShaderBackend> Default for ProgramCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ShaderBackend> ProgramCache<B> {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
            programs: HashMap::new(),
            current: ProgramKey::default(),
            active: None,
        }
    }

    /// Register a stage. The first registration of a `(kind, key)` wins.
    pub fn create_stage(
        &mut self,
        kind: StageKind,
        key: CacheKey,
        source: String,
        texture_usage: Vec<ShaderDecl>,
        uniform_usage: Vec<ShaderDecl>,
    ) -> GalResult<StageKey> {
        if kind == StageKind::Compute {
            return Err(GalError::NotSupported("compute shader stages"));
        }
        let stage_key = StageKey { kind, key };
        self.stages.entry(stage_key).or_insert_with(|| {
            trace!("Registered {:?} stage 0x{:X}", kind, key);
            ShaderStage {
                source,
                texture_usage,
                uniform_usage,
                compiled: None,
            }
        });
        Ok(stage_key)
    }

    pub fn texture_usage(&self, stage: StageKey) -> &[ShaderDecl] {
        self.stages
            .get(&stage)
            .map(|s| s.texture_usage.as_slice())
            .unwrap_or(&[])
    }

    /// Make `stage` current for its kind. Returns false for unknown stages.
    pub fn bind(&mut self, stage: StageKey) -> bool {
        match (stage.kind.graphics_index(), self.stages.contains_key(&stage)) {
            (Some(index), true) => {
                self.current.0[index] = Some(stage.key);
                true
            }
            _ => false,
        }
    }

    pub fn unbind(&mut self, kind: StageKind) {
        if let Some(index) = kind.graphics_index() {
            self.current.0[index] = None;
        }
    }

    pub fn current_key(&self) -> ProgramKey {
        self.current
    }

    /// Link (or reuse) the program for the bound stages and make it active.
    ///
    /// Returns `Ok(None)` without linking if the vertex or fragment stage is
    /// missing.
    pub fn bind_active_program(&mut self, backend: &mut B) -> GalResult<Option<&B::Program>> {
        let key = self.current;
        if !key.is_linkable() {
            trace!("Program link skipped: vertex and fragment stages are required");
            self.active = None;
            return Ok(None);
        }

        if !self.programs.contains_key(&key) {
            for stage in key.stages() {
                self.compile_stage(backend, stage)?;
            }
            let blocks = self.uniform_block_bindings(&key);
            let program = {
                let attached: Vec<(StageKind, &B::Shader)> = key
                    .stages()
                    .filter_map(|stage| {
                        let compiled = self.stages.get(&stage)?.compiled.as_ref()?;
                        Some((stage.kind, compiled))
                    })
                    .collect();
                backend.link_program(&attached, &blocks)?
            };
            debug!(
                "Linked program {:?} with {} uniform blocks",
                key.0,
                blocks.len()
            );
            self.programs.insert(key, program);
        }

        let program = self
            .programs
            .get(&key)
            .ok_or(GalError::InvalidState("linked program missing"))?;
        backend.use_program(program)?;
        self.active = Some(key);
        Ok(Some(program))
    }

    pub fn current_program(&self) -> Option<&B::Program> {
        self.active.and_then(|key| self.programs.get(&key))
    }

    /// Assign sampler `name` of the active program to texture `unit`.
    /// Returns false if no program is active.
    pub fn ensure_texture_binding(&mut self, backend: &mut B, name: &str, unit: u32) -> GalResult<bool> {
        let Some(key) = self.active else {
            trace!("Texture binding '{}' ignored: no active program", name);
            return Ok(false);
        };
        let program = self
            .programs
            .get_mut(&key)
            .ok_or(GalError::InvalidState("active program missing"))?;
        backend.set_texture_binding(program, name, unit)?;
        Ok(true)
    }

    /// Binding slots for the uniform blocks of `key`: every block of every
    /// present stage, in stage order, numbered from 0.
    pub fn uniform_block_bindings(&self, key: &ProgramKey) -> Vec<UniformBlockBinding> {
        let mut bindings = Vec::new();
        for stage in key.stages() {
            if let Some(shader) = self.stages.get(&stage) {
                for decl in &shader.uniform_usage {
                    bindings.push(UniformBlockBinding {
                        stage: stage.kind,
                        name: decl.name.clone(),
                        cbuf: decl.index,
                        slot: bindings.len() as u32,
                    });
                }
            }
        }
        bindings
    }

    /// Resolve the const buffers read by the active program to
    /// `(binding slot, key)` pairs, skipping unbound const buffers.
    pub fn const_buffer_slots(&self, bindings: &BufferBindings) -> Vec<(u32, CacheKey)> {
        let Some(active) = self.active else {
            return Vec::new();
        };
        self.uniform_block_bindings(&active)
            .into_iter()
            .filter_map(|b| bindings.get(b.stage, b.cbuf).map(|key| (b.slot, key)))
            .collect()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn release(&mut self, backend: &mut B) {
        self.active = None;
        for (_, program) in self.programs.drain() {
            backend.destroy_program(program);
        }
        for (_, stage) in self.stages.drain() {
            if let Some(shader) = stage.compiled {
                backend.destroy_shader(shader);
            }
        }
    }

    fn compile_stage(&mut self, backend: &mut B, key: StageKey) -> GalResult<()> {
        let Some(stage) = self.stages.get_mut(&key) else {
            return Err(GalError::InvalidState("bound shader stage is not registered"));
        };
        if stage.compiled.is_some() {
            return Ok(());
        }
        match backend.compile_shader(key.kind, &stage.source) {
            Ok(shader) => {
                debug!("Compiled {:?} stage 0x{:X}", key.kind, key.key);
                stage.compiled = Some(shader);
                Ok(())
            }
            Err(e) => {
                warn!("{:?} stage 0x{:X} failed to compile: {}", key.kind, key.key, e);
                self.stages.remove(&key);
                self.unbind(key.kind);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    const VERTEX: &str = "uniform Transform { vec4 offset; };\nvoid main() {}";
    const FRAGMENT: &str = "uniform Material { vec4 tint; };\nuniform Light { vec4 dir; };\nvoid main() {}";

    fn setup() -> (SoftwareBackend, ProgramCache<SoftwareBackend>) {
        (SoftwareBackend::new(), ProgramCache::new())
    }

    fn register(cache: &mut ProgramCache<SoftwareBackend>) -> (StageKey, StageKey) {
        let vs = cache
            .create_stage(
                StageKind::Vertex,
                0x10,
                VERTEX.to_string(),
                Vec::new(),
                vec![ShaderDecl::new("Transform", 1)],
            )
            .unwrap();
        let fs = cache
            .create_stage(
                StageKind::Fragment,
                0x20,
                FRAGMENT.to_string(),
                vec![ShaderDecl::new("tex0", 0)],
                vec![ShaderDecl::new("Material", 3), ShaderDecl::new("Light", 5)],
            )
            .unwrap();
        (vs, fs)
    }

    #[test]
    fn test_link_is_memoized() {
        let (mut backend, mut cache) = setup();
        let (vs, fs) = register(&mut cache);
        cache.bind(vs);
        cache.bind(fs);

        let first = *cache.bind_active_program(&mut backend).unwrap().unwrap();
        let second = *cache.bind_active_program(&mut backend).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.program_count(), 1);
        assert_eq!(backend.compile_count(), 2);
        assert_eq!(backend.link_count(), 1);
        assert_eq!(backend.current_program(), Some(first));
    }

    #[test]
    fn test_ensure_texture_binding_targets_active_program() {
        let (mut backend, mut cache) = setup();
        let (vs, fs) = register(&mut cache);
        assert!(!cache.ensure_texture_binding(&mut backend, "tex0", 2).unwrap());

        cache.bind(vs);
        cache.bind(fs);
        let program = *cache.bind_active_program(&mut backend).unwrap().unwrap();
        assert!(cache.ensure_texture_binding(&mut backend, "tex0", 2).unwrap());
        assert!(cache.ensure_texture_binding(&mut backend, "tex0", 4).unwrap());
        assert_eq!(backend.texture_unit(program, "tex0"), Some(4));
        assert_eq!(backend.texture_unit(program, "tex1"), None);

        // Unbinding a mandatory stage leaves nothing to bind against.
        cache.unbind(StageKind::Vertex);
        cache.bind_active_program(&mut backend).unwrap();
        assert!(!cache.ensure_texture_binding(&mut backend, "tex0", 1).unwrap());
    }

    #[test]
    fn test_fragment_only_never_links() {
        let (mut backend, mut cache) = setup();
        let (_, fs) = register(&mut cache);
        cache.bind(fs);

        assert!(cache.bind_active_program(&mut backend).unwrap().is_none());
        assert!(cache.current_program().is_none());
        assert_eq!(backend.link_count(), 0);
    }

    #[test]
    fn test_stage_shared_across_programs() {
        let (mut backend, mut cache) = setup();
        let (vs, fs) = register(&mut cache);
        let gs = cache
            .create_stage(StageKind::Geometry, 0x30, "void main() {}".to_string(), Vec::new(), Vec::new())
            .unwrap();
        cache.bind(vs);
        cache.bind(fs);
        cache.bind_active_program(&mut backend).unwrap();
        cache.bind(gs);
        cache.bind_active_program(&mut backend).unwrap();
        cache.unbind(StageKind::Geometry);
        cache.bind_active_program(&mut backend).unwrap();

        assert_eq!(cache.program_count(), 2);
        assert_eq!(backend.compile_count(), 3);
        assert_eq!(backend.link_count(), 2);
    }

    #[test]
    fn test_uniform_block_slots_follow_stage_order() {
        let (mut backend, mut cache) = setup();
        let (vs, fs) = register(&mut cache);
        // Bind fragment first; slot order must not depend on bind order.
        cache.bind(fs);
        cache.bind(vs);
        cache.bind_active_program(&mut backend).unwrap();

        let slots: Vec<_> = cache
            .uniform_block_bindings(&cache.current_key())
            .into_iter()
            .map(|b| (b.name, b.slot))
            .collect();
        assert_eq!(
            slots,
            vec![
                ("Transform".to_string(), 0),
                ("Material".to_string(), 1),
                ("Light".to_string(), 2)
            ]
        );

        let mut bindings = BufferBindings::new();
        bindings.set(StageKind::Vertex, 1, Some(0xA000));
        bindings.set(StageKind::Fragment, 5, Some(0xB000));
        assert_eq!(cache.const_buffer_slots(&bindings), vec![(0, 0xA000), (2, 0xB000)]);
    }

    #[test]
    fn test_failed_compile_discards_stage() {
        let (mut backend, mut cache) = setup();
        let (_, fs) = register(&mut cache);
        let bad = cache
            .create_stage(StageKind::Vertex, 0x99, String::new(), Vec::new(), Vec::new())
            .unwrap();
        cache.bind(bad);
        cache.bind(fs);

        assert!(matches!(
            cache.bind_active_program(&mut backend),
            Err(GalError::Compile { stage: StageKind::Vertex, .. })
        ));
        assert_eq!(cache.stage_count(), 1);
        assert_eq!(cache.current_key().0[0], None);
        assert_eq!(cache.program_count(), 0);
    }

    #[test]
    fn test_failed_link_caches_nothing() {
        let (mut backend, mut cache) = setup();
        let vs = cache
            .create_stage(
                StageKind::Vertex,
                1,
                "void main() {}".to_string(),
                Vec::new(),
                vec![ShaderDecl::new("Missing", 0)],
            )
            .unwrap();
        let fs = cache
            .create_stage(StageKind::Fragment, 2, "void main() {}".to_string(), Vec::new(), Vec::new())
            .unwrap();
        cache.bind(vs);
        cache.bind(fs);

        assert!(matches!(cache.bind_active_program(&mut backend), Err(GalError::Link { .. })));
        assert_eq!(cache.program_count(), 0);
        // Stages compiled fine and stay cached.
        assert_eq!(cache.stage_count(), 2);
    }

    #[test]
    fn test_compute_not_supported() {
        let (_, mut cache) = setup();
        assert!(cache
            .create_stage(StageKind::Compute, 1, "void main() {}".to_string(), Vec::new(), Vec::new())
            .unwrap_err()
            .is_not_supported());
    }

    #[test]
    fn test_create_stage_first_wins() {
        let (_, mut cache) = setup();
        let tex = vec![ShaderDecl::new("a", 0)];
        let key = cache
            .create_stage(StageKind::Fragment, 7, "void main() {}".to_string(), tex.clone(), Vec::new())
            .unwrap();
        cache
            .create_stage(StageKind::Fragment, 7, "other".to_string(), Vec::new(), Vec::new())
            .unwrap();
        assert_eq!(cache.texture_usage(key), &tex[..]);
        assert!(cache
            .texture_usage(StageKey {
                kind: StageKind::Vertex,
                key: 7
            })
            .is_empty());
    }
}
