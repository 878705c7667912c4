//! `panelctl ignored [name]`.

use anyhow::Result;

use panel_core::{FilesToIgnore, ServiceConfig};

pub fn run(config: &ServiceConfig, name: Option<&str>, output_json: bool) -> Result<()> {
    let files = FilesToIgnore::from_config(config);

    match name {
        Some(name) => {
            let ignored = files.contains(name);
            if output_json {
                println!("{}", serde_json::json!({ "name": name, "ignored": ignored }));
            } else if ignored {
                println!("{} is ignored.", name);
            } else {
                println!("{} is not ignored.", name);
            }
        }
        None => {
            if output_json {
                let names: Vec<&str> = files.iter().map(|e| e.name.as_str()).collect();
                println!("{}", serde_json::json!({ "count": files.len(), "names": names }));
            } else {
                println!("{} ignorable file name(s):", files.len());
                for entry in &files {
                    println!("  {}", entry.name);
                }
            }
        }
    }
    Ok(())
}
