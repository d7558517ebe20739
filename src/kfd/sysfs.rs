#![allow(clippy::cast_possible_truncation)]

use std::fs;
use std::io;
use std::path::Path;

const KFD_SYSFS_PATH: &str = "/sys/devices/virtual/kfd/kfd/topology";

pub const HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC: u32 = 1;
pub const HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE: u32 = 2;

/// The topology facts the pool needs about one GPU node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuNode {
    /// Index of the node directory under `topology/nodes`.
    pub node_id: u32,
    /// Driver-assigned GPU id used by every memory ioctl.
    pub gpu_id: u32,
    /// Minor number of `/dev/dri/renderD<minor>`.
    pub drm_render_minor: i32,
    /// `local_mem_size` reported by the node properties.
    pub local_mem_size: u64,
    /// Sum of the frame-buffer heaps found under `mem_banks`.
    pub vram_bytes: u64,
}

impl GpuNode {
    /// Total device memory, preferring the heap breakdown over `local_mem_size`.
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        if self.vram_bytes > 0 {
            self.vram_bytes
        } else {
            self.local_mem_size
        }
    }

    #[must_use]
    pub fn render_node_path(&self) -> String {
        format!("/dev/dri/renderD{}", self.drm_render_minor)
    }
}

/// Scan the KFD topology and return every node that has a GPU attached, in node order.
///
/// # Errors
/// Returns an error if the topology directory cannot be read.
pub fn gpu_nodes() -> io::Result<Vec<GpuNode>> {
    gpu_nodes_at(&Path::new(KFD_SYSFS_PATH).join("nodes"))
}

pub(crate) fn gpu_nodes_at(nodes_dir: &Path) -> io::Result<Vec<GpuNode>> {
    let mut node_ids: Vec<u32> = fs::read_dir(nodes_dir)?
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    node_ids.sort_unstable();

    let mut nodes = Vec::new();
    for node_id in node_ids {
        let path = nodes_dir.join(node_id.to_string());
        let gpu_id = fs::read_to_string(path.join("gpu_id"))
            .ok()
            .and_then(|txt| txt.trim().parse::<u32>().ok())
            .unwrap_or(0);

        // CPU-only nodes report gpu_id 0
        if gpu_id == 0 {
            continue;
        }

        let mut node = parse_node_properties(&fs::read_to_string(path.join("properties"))?);
        node.node_id = node_id;
        node.gpu_id = gpu_id;
        node.vram_bytes = frame_buffer_bytes(&path.join("mem_banks"));
        nodes.push(node);
    }
    Ok(nodes)
}

fn frame_buffer_bytes(banks_dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(banks_dir) else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|e| fs::read_to_string(e.path().join("properties")).ok())
        .filter_map(|content| {
            let (heap_type, size) = parse_memory_bank(&content);
            matches!(
                heap_type,
                HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC | HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE
            )
            .then_some(size)
        })
        .sum()
}

/// Iterate the `key value` lines of a sysfs properties file, skipping non-numeric values.
fn numeric_properties(content: &str) -> impl Iterator<Item = (&str, u64)> {
    content.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?.parse::<u64>().ok()?;
        Some((key, val))
    })
}

pub(crate) fn parse_node_properties(content: &str) -> GpuNode {
    let mut node = GpuNode::default();
    for (k, val) in numeric_properties(content) {
        match k {
            "drm_render_minor" => node.drm_render_minor = val as i32,
            "local_mem_size" => node.local_mem_size = val,
            _ => {}
        }
    }
    node
}

/// Returns `(heap_type, size_in_bytes)` of one `mem_banks/<n>/properties` file.
pub(crate) fn parse_memory_bank(content: &str) -> (u32, u64) {
    let mut heap_type = 0;
    let mut size = 0;
    for (k, val) in numeric_properties(content) {
        match k {
            "heap_type" => heap_type = val as u32,
            "size_in_bytes" => size = val,
            _ => {}
        }
    }
    (heap_type, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const NODE_PROPERTIES: &str = "cpu_cores_count 0\nsimd_count 192\nmem_banks_count 1\n\
        local_mem_size 17163091968\ndrm_render_minor 128\nname gfx1100\n";

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hsa-pool-sysfs-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_node_properties() {
        let node = parse_node_properties(NODE_PROPERTIES);
        assert_eq!(node.drm_render_minor, 128);
        assert_eq!(node.local_mem_size, 17_163_091_968);
        assert_eq!(node.render_node_path(), "/dev/dri/renderD128");
    }

    #[test]
    fn parses_memory_bank() {
        let (heap, size) = parse_memory_bank("heap_type 2\nsize_in_bytes 4096\nflags 0\nwidth 256\n");
        assert_eq!(heap, HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE);
        assert_eq!(size, 4096);
    }

    #[test]
    fn total_memory_falls_back_to_local_mem_size() {
        let mut node = parse_node_properties(NODE_PROPERTIES);
        assert_eq!(node.total_memory(), 17_163_091_968);
        node.vram_bytes = 1 << 30;
        assert_eq!(node.total_memory(), 1 << 30);
    }

    #[test]
    fn scans_topology_tree_and_skips_cpu_nodes() {
        let root = scratch_dir("scan");

        let cpu = root.join("0");
        fs::create_dir_all(&cpu).unwrap();
        fs::write(cpu.join("gpu_id"), "0\n").unwrap();
        fs::write(cpu.join("properties"), "cpu_cores_count 16\n").unwrap();

        let gpu = root.join("1");
        fs::create_dir_all(gpu.join("mem_banks/0")).unwrap();
        fs::create_dir_all(gpu.join("mem_banks/1")).unwrap();
        fs::write(gpu.join("gpu_id"), "53124\n").unwrap();
        fs::write(gpu.join("properties"), NODE_PROPERTIES).unwrap();
        fs::write(
            gpu.join("mem_banks/0/properties"),
            "heap_type 1\nsize_in_bytes 268435456\n",
        )
        .unwrap();
        fs::write(
            gpu.join("mem_banks/1/properties"),
            "heap_type 0\nsize_in_bytes 999\n",
        )
        .unwrap();

        let nodes = gpu_nodes_at(&root).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, 1);
        assert_eq!(nodes[0].gpu_id, 53124);
        assert_eq!(nodes[0].vram_bytes, 268_435_456);

        fs::remove_dir_all(&root).unwrap();
    }
}
