//! Libvirt domain XML rendering and `virsh`-style define invocation.
//!
//! Rendering is a fixed template with substitution — no templating engine
//! needed for eight placeholders. Invocation is an external collaborator;
//! a failure here is logged but not fatal to the pipeline as long as the
//! convert stage already succeeded.

use std::path::Path;

use vmforge_process::{run_command, CommandResult};

/// Substitution values for the domain XML template.
#[derive(Debug, Clone)]
pub struct DomainParams {
    pub name: String,
    pub memory_kib: u64,
    pub vcpu: u32,
    pub disk_path: String,
    pub disk_format: String,
    pub firmware_uefi: bool,
    pub network_bridge: String,
    pub mac_address: Option<String>,
}

/// Render a KVM-type domain document. UEFI firmware switches the machine
/// type from `pc` to `q35` and loads an OVMF code blob.
pub fn render_domain_xml(params: &DomainParams) -> String {
    let (machine, loader) = if params.firmware_uefi {
        (
            "q35",
            "    <loader readonly='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.fd</loader>\n",
        )
    } else {
        ("pc", "")
    };

    let mac_line = params
        .mac_address
        .as_ref()
        .map(|mac| format!("      <mac address='{mac}'/>\n"))
        .unwrap_or_default();

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu placement='static'>{vcpu}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
{loader}    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{disk_format}'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <controller type='usb' model='qemu-xhci'/>
    <controller type='pci' model='pcie-root'/>
    <controller type='virtio-serial'/>
    <interface type='bridge'>
      <source bridge='{network_bridge}'/>
{mac_line}      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <input type='tablet' bus='usb'/>
    <graphics type='vnc' port='-1' listen='127.0.0.1'/>
    <video>
      <model type='qxl'/>
    </video>
    <memballoon model='virtio'/>
    <rng model='virtio'>
      <backend model='random'>/dev/urandom</backend>
    </rng>
  </devices>
</domain>
"#,
        name = params.name,
        memory_kib = params.memory_kib,
        vcpu = params.vcpu,
        machine = machine,
        loader = loader,
        disk_format = params.disk_format,
        disk_path = params.disk_path,
        network_bridge = params.network_bridge,
        mac_line = mac_line,
    )
}

#[derive(Debug, thiserror::Error)]
pub enum LibvirtError {
    #[error("failed to write domain XML to {path}: {source}")]
    WriteFailed { path: String, source: std::io::Error },
    #[error("virsh define failed: {0}")]
    DefineFailed(String),
    #[error("virsh autostart failed: {0}")]
    AutostartFailed(String),
}

/// Write the rendered XML to a temp file and invoke `virsh define` against
/// `uri`. Returns the domain-define command's result for the caller to
/// decide fatality.
pub fn define_domain(uri: &str, xml: &str) -> Result<CommandResult, LibvirtError> {
    let mut file = tempfile::Builder::new()
        .prefix("vmforge-domain-")
        .suffix(".xml")
        .tempfile()
        .map_err(|source| LibvirtError::WriteFailed { path: "<tmp>".to_string(), source })?;
    use std::io::Write;
    file.write_all(xml.as_bytes())
        .map_err(|source| LibvirtError::WriteFailed { path: file.path().display().to_string(), source })?;

    let path = file.path().to_path_buf();
    run_command("virsh", &["--connect", uri, "define", &path.to_string_lossy()])
        .map_err(|e| LibvirtError::DefineFailed(e.to_string()))
}

pub fn autostart_domain(uri: &str, name: &str) -> Result<CommandResult, LibvirtError> {
    run_command("virsh", &["--connect", uri, "autostart", name]).map_err(|e| LibvirtError::AutostartFailed(e.to_string()))
}

/// Copy `source` into the daemon-mode watch directory (a no-op wrapper kept
/// here so the watch-dir hand-off shares this module's error type).
pub fn copy_into(source: &Path, watch_dir: &Path) -> std::io::Result<std::path::PathBuf> {
    std::fs::create_dir_all(watch_dir)?;
    let dest = watch_dir.join(source.file_name().unwrap_or_default());
    std::fs::copy(source, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bios_uses_pc_machine_type() {
        let params = DomainParams {
            name: "vm1".into(),
            memory_kib: 2 * 1024 * 1024,
            vcpu: 2,
            disk_path: "/exports/vm1/disk0.qcow2".into(),
            disk_format: "qcow2".into(),
            firmware_uefi: false,
            network_bridge: "br0".into(),
            mac_address: None,
        };
        let xml = render_domain_xml(&params);
        assert!(xml.contains("machine='pc'"));
        assert!(!xml.contains("OVMF"));
    }

    #[test]
    fn uefi_switches_to_q35_and_loads_ovmf() {
        let params = DomainParams {
            name: "vm1".into(),
            memory_kib: 4 * 1024 * 1024,
            vcpu: 4,
            disk_path: "/exports/vm1/disk0.qcow2".into(),
            disk_format: "qcow2".into(),
            firmware_uefi: true,
            network_bridge: "br0".into(),
            mac_address: Some("52:54:00:12:34:56".into()),
        };
        let xml = render_domain_xml(&params);
        assert!(xml.contains("machine='q35'"));
        assert!(xml.contains("OVMF_CODE.fd"));
        assert!(xml.contains("52:54:00:12:34:56"));
    }

    #[test]
    fn xml_includes_all_required_device_shapes() {
        let params = DomainParams {
            name: "vm2".into(),
            memory_kib: 1024,
            vcpu: 1,
            disk_path: "/d".into(),
            disk_format: "raw".into(),
            firmware_uefi: false,
            network_bridge: "br1".into(),
            mac_address: None,
        };
        let xml = render_domain_xml(&params);
        for expected in [
            "type='usb'",
            "type='pci'",
            "virtio-serial",
            "type='tablet'",
            "type='vnc'",
            "listen='127.0.0.1'",
            "type='qxl'",
            "memballoon",
            "model='virtio'",
        ] {
            assert!(xml.contains(expected), "missing {expected} in:\n{xml}");
        }
    }
}
