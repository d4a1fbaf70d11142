//! Structural validation of the scene graph.
//!
//! Objects are checked kind by kind in creation order and the first defect
//! is reported, so the same graph always yields the same message.

use lumen_gpu::{GpuError, Result};

use crate::context::SceneContext;
use crate::graph::{Node, ProgramId, Variable};

fn defect(message: String) -> Result<()> {
    Err(GpuError::GraphValidation(message))
}

impl SceneContext {
    /// Check the graph for structural defects.
    pub fn validate(&self) -> Result<()> {
        self.validate_entry_points()?;
        self.validate_groups()?;
        self.validate_leaves()?;
        self.validate_materials()?;
        self.validate_variables()
    }

    fn node_exists(&self, node: Node) -> bool {
        match node {
            Node::Group(id) => self.groups.contains(id),
            Node::GeometryGroup(id) => self.geometry_groups.contains(id),
            Node::Transform(id) => self.transforms.contains(id),
        }
    }

    fn check_program(&self, owner: &str, program: ProgramId) -> Result<()> {
        if self.programs.contains(program) {
            Ok(())
        } else {
            defect(format!("{owner} references missing {program:?}"))
        }
    }

    fn validate_entry_points(&self) -> Result<()> {
        for (entry, program) in self.ray_generation.iter().enumerate() {
            match program {
                Some(program) => self.check_program(&format!("entry point {entry}"), *program)?,
                None => {
                    return defect(format!("entry point {entry} has no ray generation program"))
                }
            }
        }
        for (entry, program) in self.exception.iter().enumerate() {
            if let Some(program) = program {
                self.check_program(&format!("entry point {entry}"), *program)?;
            }
        }
        for (&ray_type, &program) in &self.miss {
            self.check_ray_type("miss program", ray_type)?;
            self.check_program(&format!("miss program of ray type {ray_type}"), program)?;
        }
        Ok(())
    }

    fn validate_groups(&self) -> Result<()> {
        for (id, group) in self.groups.iter() {
            let Some(acceleration) = group.acceleration else {
                return defect(format!("{id:?} has no acceleration"));
            };
            if !self.accelerations.contains(acceleration) {
                return defect(format!("{id:?} references missing {acceleration:?}"));
            }
            if let Some(child) = group.children.iter().find(|c| !self.node_exists(**c)) {
                return defect(format!("{id:?} references missing {child:?}"));
            }
        }

        for (id, group) in self.geometry_groups.iter() {
            let Some(acceleration) = group.acceleration else {
                return defect(format!("{id:?} has no acceleration"));
            };
            if !self.accelerations.contains(acceleration) {
                return defect(format!("{id:?} references missing {acceleration:?}"));
            }
            if let Some(instance) = group.instances.iter().find(|i| !self.instances.contains(**i)) {
                return defect(format!("{id:?} references missing {instance:?}"));
            }
        }

        for (id, transform) in self.transforms.iter() {
            match transform.child {
                None => return defect(format!("{id:?} has no child")),
                Some(child) if !self.node_exists(child) => {
                    return defect(format!("{id:?} references missing {child:?}"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn validate_leaves(&self) -> Result<()> {
        for (id, instance) in self.instances.iter() {
            match instance.geometry {
                None => return defect(format!("{id:?} has no geometry")),
                Some(geometry) if !self.geometries.contains(geometry) => {
                    return defect(format!("{id:?} references missing {geometry:?}"))
                }
                Some(_) => {}
            }
            if instance.materials.is_empty() {
                return defect(format!("{id:?} has no materials"));
            }
            if let Some(material) = instance.materials.iter().find(|m| !self.materials.contains(**m)) {
                return defect(format!("{id:?} references missing {material:?}"));
            }
        }

        for (id, geometry) in self.geometries.iter() {
            let owner = format!("{id:?}");
            match geometry.intersection {
                None => return defect(format!("{owner} has no intersection program")),
                Some(program) => self.check_program(&owner, program)?,
            }
            match geometry.bounding_box {
                None => return defect(format!("{owner} has no bounding box program")),
                Some(program) => self.check_program(&owner, program)?,
            }
        }
        Ok(())
    }

    fn validate_materials(&self) -> Result<()> {
        for (id, material) in self.materials.iter() {
            let owner = format!("{id:?}");
            for (&ray_type, &program) in material.closest_hit.iter().chain(&material.any_hit) {
                self.check_ray_type(&owner, ray_type)?;
                self.check_program(&owner, program)?;
            }
        }
        Ok(())
    }

    fn validate_variables(&self) -> Result<()> {
        let mut names: Vec<&String> = self.variables.keys().collect();
        names.sort();
        for name in names {
            let dangling = match self.variables[name] {
                Variable::Node(node) => !self.node_exists(node),
                Variable::Buffer(buffer) => !self.buffers.contains(buffer),
                _ => false,
            };
            if dangling {
                return defect(format!("variable '{name}' references a missing object"));
            }
        }

        for (id, program) in self.programs.iter() {
            if let Some(name) = program
                .required_variables
                .iter()
                .find(|name| !self.variables.contains_key(name.as_str()))
            {
                return defect(format!(
                    "{id:?} ({}) requires unbound variable '{name}'",
                    program.entry_point
                ));
            }
        }
        Ok(())
    }

    fn check_ray_type(&self, owner: &str, ray_type: u32) -> Result<()> {
        if ray_type < self.config.ray_type_count {
            Ok(())
        } else {
            defect(format!(
                "{owner} uses ray type {ray_type} but only {} ray type(s) are configured",
                self.config.ray_type_count
            ))
        }
    }
}
