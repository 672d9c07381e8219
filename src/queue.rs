use crate::{ConfigError, Result};
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
    Present,
}

#[derive(Debug, Clone)]
pub struct QueueDesc {
    pub name: String,
    pub queue_type: QueueType,
    pub priority: f32,
}

impl QueueDesc {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            name: format!("{:?} Queue", queue_type),
            queue_type,
            priority: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAssignment {
    pub family_index: u32,
    pub queue_index: u32,
}

fn family_supports(
    family: &vk::QueueFamilyProperties,
    family_index: u32,
    queue_type: QueueType,
    supports_present: &impl Fn(u32) -> bool,
) -> bool {
    match queue_type {
        QueueType::Graphics => family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
        QueueType::Compute => family.queue_flags.contains(vk::QueueFlags::COMPUTE),
        // Graphics and compute families accept transfer work even when the bit isn't reported
        QueueType::Transfer => family.queue_flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        ),
        QueueType::Present => supports_present(family_index),
    }
}

/// Assigns every requested queue to a family, reusing an already claimed queue when it can.
pub(crate) fn assign_queue_families(
    families: &[vk::QueueFamilyProperties],
    requests: &[QueueType],
    supports_present: impl Fn(u32) -> bool,
) -> Result<Vec<QueueAssignment>> {
    let mut assignments: Vec<QueueAssignment> = Vec::with_capacity(requests.len());
    let mut claimed_per_family = vec![0u32; families.len()];

    for &queue_type in requests {
        let reused = assignments.iter().copied().find(|assignment| {
            family_supports(
                &families[assignment.family_index as usize],
                assignment.family_index,
                queue_type,
                &supports_present,
            )
        });

        let assignment = match reused {
            Some(assignment) => assignment,
            None => {
                let family_index = families
                    .iter()
                    .enumerate()
                    .find(|(index, family)| {
                        claimed_per_family[*index] < family.queue_count
                            && family_supports(family, *index as u32, queue_type, &supports_present)
                    })
                    .map(|(index, _)| index)
                    .ok_or(ConfigError::MissingQueueFamily { queue_type })?;

                let queue_index = claimed_per_family[family_index];
                claimed_per_family[family_index] += 1;
                QueueAssignment {
                    family_index: family_index as u32,
                    queue_index,
                }
            }
        };

        trace!(
            "{:?} queue assigned to family {} queue {}",
            queue_type,
            assignment.family_index,
            assignment.queue_index
        );
        assignments.push(assignment);
    }

    Ok(assignments)
}

/// Per family, in first claim order, the priority of each created queue.
/// A shared queue takes the highest priority among the logical queues using it.
pub(crate) fn family_priorities(
    assignments: &[QueueAssignment],
    priorities: &[f32],
) -> Vec<(u32, Vec<f32>)> {
    let mut families: Vec<(u32, Vec<f32>)> = Vec::new();
    for (assignment, &priority) in assignments.iter().zip(priorities) {
        let position = match families
            .iter()
            .position(|(family_index, _)| *family_index == assignment.family_index)
        {
            Some(position) => position,
            None => {
                families.push((assignment.family_index, Vec::new()));
                families.len() - 1
            }
        };

        let queue_priorities = &mut families[position].1;
        let queue_index = assignment.queue_index as usize;
        if queue_priorities.len() <= queue_index {
            queue_priorities.resize(queue_index + 1, 0.0);
        }
        queue_priorities[queue_index] = queue_priorities[queue_index].max(priority);
    }
    families
}

/// A logical queue with its native handle.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub(crate) queue_type: QueueType,
    pub(crate) assignment: QueueAssignment,
    pub(crate) priority: f32,
    pub(crate) handle: vk::Queue,
}

impl Queue {
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn family_index(&self) -> u32 {
        self.assignment.family_index
    }

    pub fn queue_index(&self) -> u32 {
        self.assignment.queue_index
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(queue_flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags,
            queue_count,
            ..Default::default()
        }
    }

    #[test]
    fn later_queues_reuse_earlier_claims() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
        ];

        let assignments = assign_queue_families(
            &families,
            &[
                QueueType::Graphics,
                QueueType::Compute,
                QueueType::Transfer,
                QueueType::Present,
            ],
            |family_index| family_index == 0,
        )
        .unwrap();

        let shared = QueueAssignment {
            family_index: 0,
            queue_index: 0,
        };
        assert_eq!(assignments, vec![shared; 4]);
    }

    #[test]
    fn first_capable_family_is_claimed() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];

        let assignments = assign_queue_families(
            &families,
            &[QueueType::Transfer, QueueType::Graphics, QueueType::Compute],
            |_| false,
        )
        .unwrap();

        assert_eq!(assignments[0].family_index, 0);
        assert_eq!(assignments[1].family_index, 2);
        assert_eq!(assignments[2].family_index, 1);
    }

    #[test]
    fn present_without_support_is_a_config_error() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let error = assign_queue_families(
            &families,
            &[QueueType::Graphics, QueueType::Present],
            |_| false,
        )
        .unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::MissingQueueFamily {
                queue_type: QueueType::Present
            })
        );
    }

    #[test]
    fn shared_queue_takes_highest_priority() {
        let assignments = [
            QueueAssignment {
                family_index: 1,
                queue_index: 0,
            },
            QueueAssignment {
                family_index: 0,
                queue_index: 0,
            },
            QueueAssignment {
                family_index: 1,
                queue_index: 0,
            },
        ];
        let families = family_priorities(&assignments, &[0.25, 1.0, 0.75]);
        assert_eq!(families, vec![(1, vec![0.75]), (0, vec![1.0])]);
    }
}
