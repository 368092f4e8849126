use std::ffi::{c_void, CString};
use std::mem::transmute;

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;
use openxr as xr;

/// Swapchain formats we can fill from RGBA8 sRGB pixels, best first.
const SWAPCHAIN_FORMATS: [(vk::Format, bool); 2] = [
    (vk::Format::R8G8B8A8_SRGB, false),
    (vk::Format::B8G8R8A8_SRGB, true),
];

const UPLOAD_TIMEOUT_NS: u64 = 100_000_000;

/// Picks a swapchain format from what the runtime offers. The flag is set
/// when red and blue must be swapped on upload.
pub fn choose_swapchain_format(available: &[u32]) -> Option<(vk::Format, bool)> {
    SWAPCHAIN_FORMATS
        .into_iter()
        .find(|(format, _)| available.contains(&(format.as_raw() as u32)))
}

/// Copies `rows` rows of RGBA8 pixels, optionally bottom-up and with red and
/// blue exchanged.
pub fn copy_rows(
    src: &[u8],
    dst: &mut [u8],
    row_bytes: usize,
    rows: usize,
    flip: bool,
    swap_rb: bool,
) {
    for row in 0..rows {
        let src_row = if flip { rows - 1 - row } else { row };
        let from = &src[src_row * row_bytes..(src_row + 1) * row_bytes];
        let to = &mut dst[row * row_bytes..(row + 1) * row_bytes];
        to.copy_from_slice(from);
        if swap_rb {
            for pixel in to.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
    }
}

/// Vulkan instance and device created through the OpenXR runtime, plus what
/// is needed to copy CPU pixels into swapchain images.
pub struct VulkanContext {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    staging_buffer: vk::Buffer,
    staging_memory: vk::DeviceMemory,
    staging_size: vk::DeviceSize,
    upload_fence: vk::Fence,
    _entry: ash::Entry,
}

impl VulkanContext {
    pub fn new(xr_instance: &xr::Instance, system: xr::SystemId) -> Result<Self> {
        let entry = ash::Entry::linked();

        let requirements = xr_instance
            .graphics_requirements::<xr::Vulkan>(system)
            .map_err(|err| anyhow::anyhow!("Failed to get Vulkan requirements: {}", err))?;
        let min = requirements.min_api_version_supported;
        let api_version = vk::make_api_version(0, min.major() as u32, min.minor() as u32, 0)
            .max(vk::API_VERSION_1_1);
        log::debug!(
            "Runtime accepts Vulkan {}.{} to {}.{}",
            min.major(),
            min.minor(),
            requirements.max_api_version_supported.major(),
            requirements.max_api_version_supported.minor()
        );

        let get_instance_proc_addr = entry.static_fn().get_instance_proc_addr;

        let app_name = CString::new(env!("CARGO_PKG_NAME"))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .engine_name(&app_name)
            .api_version(api_version);
        let create_info = vk::InstanceCreateInfo::builder().application_info(&app_info);

        let raw_instance = unsafe {
            xr_instance
                .create_vulkan_instance(
                    system,
                    transmute(get_instance_proc_addr),
                    &*create_info as *const _ as *const _,
                )
                .map_err(|err| anyhow::anyhow!("Failed to create Vulkan instance: {}", err))?
                .map_err(|raw| anyhow::anyhow!("Vulkan error: {}", vk::Result::from_raw(raw)))?
        };
        let instance = unsafe {
            ash::Instance::load(entry.static_fn(), vk::Instance::from_raw(raw_instance as u64))
        };

        let raw_physical_device = unsafe {
            xr_instance
                .vulkan_graphics_device(system, raw_instance)
                .map_err(|err| anyhow::anyhow!("Failed to get Vulkan physical device: {}", err))?
        };
        let physical_device = vk::PhysicalDevice::from_raw(raw_physical_device as u64);

        let queue_family_index = match find_graphics_queue_family(&instance, physical_device) {
            Ok(index) => index,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_create_info =
            vk::DeviceCreateInfo::builder().queue_create_infos(std::slice::from_ref(&queue_info));

        let raw_device = unsafe {
            xr_instance.create_vulkan_device(
                system,
                transmute(get_instance_proc_addr),
                raw_physical_device,
                &*device_create_info as *const _ as *const _,
            )
        };
        let raw_device = match raw_device {
            Ok(Ok(device)) => device,
            Ok(Err(raw)) => {
                unsafe { instance.destroy_instance(None) };
                return Err(anyhow::anyhow!("Vulkan error: {}", vk::Result::from_raw(raw)));
            }
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(anyhow::anyhow!("Failed to create Vulkan device: {}", err));
            }
        };
        let device = unsafe {
            ash::Device::load(instance.fp_v1_0(), vk::Device::from_raw(raw_device as u64))
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let mut context = Self {
            instance,
            device,
            physical_device,
            queue,
            queue_family_index,
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            staging_buffer: vk::Buffer::null(),
            staging_memory: vk::DeviceMemory::null(),
            staging_size: 0,
            upload_fence: vk::Fence::null(),
            _entry: entry,
        };
        // From here on, Drop cleans up whatever was created.
        context.create_upload_objects()?;
        Ok(context)
    }

    fn create_upload_objects(&mut self) -> Result<()> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.command_pool = unsafe {
            self.device
                .create_command_pool(&pool_info, None)
                .map_err(|e| anyhow::anyhow!("Failed to create command pool: {}", e))?
        };

        let buffer_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&buffer_info)
                .map_err(|e| anyhow::anyhow!("Failed to allocate command buffer: {}", e))?
        };
        self.command_buffer = buffers
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Vulkan returned no command buffer"))?;

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        self.upload_fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| anyhow::anyhow!("Failed to create fence: {}", e))?
        };
        Ok(())
    }

    pub fn session_create_info(&self) -> xr::vulkan::SessionCreateInfo {
        xr::vulkan::SessionCreateInfo {
            instance: self.instance.handle().as_raw() as *const c_void,
            physical_device: self.physical_device.as_raw() as *const c_void,
            device: self.device.handle().as_raw() as *const c_void,
            queue_family_index: self.queue_family_index,
            queue_index: 0,
        }
    }

    fn ensure_staging(&mut self, size: vk::DeviceSize) -> Result<()> {
        if self.staging_size >= size && self.staging_buffer != vk::Buffer::null() {
            return Ok(());
        }
        self.destroy_staging();

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let staging_buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| anyhow::anyhow!("Failed to create staging buffer: {}", e))?
        };
        self.staging_buffer = staging_buffer;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(staging_buffer) };
        let memory_type_index = find_memory_type(
            &self.instance,
            self.physical_device,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or_else(|| anyhow::anyhow!("No host-visible Vulkan memory type"))?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        self.staging_memory = unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(|e| anyhow::anyhow!("Failed to allocate staging memory: {}", e))?
        };
        unsafe {
            self.device
                .bind_buffer_memory(staging_buffer, self.staging_memory, 0)
                .map_err(|e| anyhow::anyhow!("Failed to bind staging memory: {}", e))?;
        }
        self.staging_size = size;
        Ok(())
    }

    fn destroy_staging(&mut self) {
        unsafe {
            if self.staging_buffer != vk::Buffer::null() {
                self.device.destroy_buffer(self.staging_buffer, None);
            }
            if self.staging_memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.staging_memory, None);
            }
        }
        self.staging_buffer = vk::Buffer::null();
        self.staging_memory = vk::DeviceMemory::null();
        self.staging_size = 0;
    }

    /// Replaces the contents of a swapchain image with `data` and waits for
    /// the copy, so the image can be released right after.
    pub fn upload_rgba(
        &mut self,
        image: vk::Image,
        width: u32,
        height: u32,
        data: &[u8],
        flip: bool,
        swap_rb: bool,
    ) -> Result<()> {
        let row_bytes = width as usize * 4;
        let size = row_bytes * height as usize;
        if size == 0 {
            return Ok(());
        }
        if data.len() < size {
            return Err(anyhow::anyhow!(
                "Eye image holds {} bytes, {}x{} needs {}",
                data.len(),
                width,
                height,
                size
            ));
        }

        unsafe {
            self.device
                .wait_for_fences(&[self.upload_fence], true, UPLOAD_TIMEOUT_NS)
                .map_err(|e| anyhow::anyhow!("Previous upload did not finish: {}", e))?;
        }
        self.ensure_staging(size as vk::DeviceSize)?;

        unsafe {
            let ptr = self
                .device
                .map_memory(
                    self.staging_memory,
                    0,
                    size as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(|e| anyhow::anyhow!("Failed to map staging memory: {}", e))?;
            let staging = std::slice::from_raw_parts_mut(ptr.cast::<u8>(), size);
            copy_rows(data, staging, row_bytes, height as usize, flip, swap_rb);
            self.device.unmap_memory(self.staging_memory);

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| anyhow::anyhow!("Failed to reset command buffer: {}", e))?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| anyhow::anyhow!("Failed to begin command buffer: {}", e))?;

            let subresource_range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };

            // The whole image is overwritten, so its old contents can be discarded.
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .image(image)
                .subresource_range(subresource_range);
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_transfer),
            );

            let region = vk::BufferImageCopy::builder()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D { width, height, depth: 1 });
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                self.staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );

            // Runtimes expect color swapchain images back in attachment layout.
            let to_color = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .image(image)
                .subresource_range(subresource_range);
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_color),
            );

            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| anyhow::anyhow!("Failed to end command buffer: {}", e))?;

            self.device
                .reset_fences(&[self.upload_fence])
                .map_err(|e| anyhow::anyhow!("Failed to reset fence: {}", e))?;
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(std::slice::from_ref(&self.command_buffer));
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), self.upload_fence)
                .map_err(|e| anyhow::anyhow!("Failed to submit upload: {}", e))?;
            self.device
                .wait_for_fences(&[self.upload_fence], true, UPLOAD_TIMEOUT_NS)
                .map_err(|e| anyhow::anyhow!("Upload did not finish: {}", e))?;
        }
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        self.destroy_staging();
        unsafe {
            if self.upload_fence != vk::Fence::null() {
                self.device.destroy_fence(self.upload_fence, None);
            }
            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan device released");
    }
}

fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
        .ok_or_else(|| anyhow::anyhow!("No Vulkan graphics queue family"))
}

fn find_memory_type(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..memory.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && memory.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_rgba_swapchains() {
        let rgba = vk::Format::R8G8B8A8_SRGB.as_raw() as u32;
        let bgra = vk::Format::B8G8R8A8_SRGB.as_raw() as u32;
        assert_eq!(rgba, 43);
        assert_eq!(
            choose_swapchain_format(&[bgra, rgba]),
            Some((vk::Format::R8G8B8A8_SRGB, false))
        );
        assert_eq!(choose_swapchain_format(&[bgra]), Some((vk::Format::B8G8R8A8_SRGB, true)));
        assert_eq!(choose_swapchain_format(&[37]), None);
    }

    #[test]
    fn test_copy_rows_flips_bottom_up() {
        // Two rows of one pixel each.
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        copy_rows(&src, &mut dst, 4, 2, true, false);
        assert_eq!(dst, [5, 6, 7, 8, 1, 2, 3, 4]);

        copy_rows(&src, &mut dst, 4, 2, false, false);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_rows_swaps_red_and_blue() {
        let src = [10, 20, 30, 255, 40, 50, 60, 128];
        let mut dst = [0u8; 8];
        copy_rows(&src, &mut dst, 8, 1, false, true);
        assert_eq!(dst, [30, 20, 10, 255, 60, 50, 40, 128]);
    }
}
